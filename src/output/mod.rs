//! Output module for run statistics and console reports
//!
//! This module handles:
//! - Counting items and rows over one run
//! - Printing the run summary, the ledger view and table info

pub mod stats;

pub use stats::{print_ledger_summary, print_statistics, print_table_info, RunStatistics};
