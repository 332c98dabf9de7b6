//! Run statistics and console reports
//!
//! This module provides the per-invocation counters produced by the
//! orchestrator and the plain-text views printed by the CLI.

use crate::checkpoint::LedgerSummary;
use crate::state::{CheckpointRecord, ItemStatus};
use crate::storage::{AppendOutcome, TableInfo};
use serde::Serialize;
use std::time::Duration;

/// Counters for one run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStatistics {
    /// Items a worker claimed and started
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Items already done before the run started
    pub skipped: u64,
    pub rows_inserted: u64,
    pub rows_skipped_duplicates: u64,
    pub rows_replaced: u64,
    #[serde(skip)]
    pub elapsed: Duration,
    /// Stopped early by the cancellation signal
    pub cancelled: bool,
    /// Stopped early by a run-level failure
    pub aborted: bool,
}

impl RunStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one storage outcome into the row counters
    pub fn record_rows(&mut self, outcome: &AppendOutcome) {
        self.rows_inserted += outcome.inserted as u64;
        self.rows_skipped_duplicates += outcome.skipped_duplicates as u64;
        self.rows_replaced += outcome.replaced as u64;
    }

    /// Share of attempted items that succeeded (%)
    pub fn success_rate(&self) -> f64 {
        if self.attempted == 0 {
            0.0
        } else {
            (self.succeeded as f64 / self.attempted as f64) * 100.0
        }
    }

    pub fn log_summary(&self, job: &str) {
        tracing::info!(
            job,
            attempted = self.attempted,
            succeeded = self.succeeded,
            failed = self.failed,
            skipped = self.skipped,
            rows_inserted = self.rows_inserted,
            rows_skipped_duplicates = self.rows_skipped_duplicates,
            rows_replaced = self.rows_replaced,
            success_rate = format!("{:.1}%", self.success_rate()),
            elapsed = format!("{:.1}s", self.elapsed.as_secs_f64()),
            cancelled = self.cancelled,
            aborted = self.aborted,
            "Run finished"
        );
    }
}

/// Prints run statistics to stdout
pub fn print_statistics(job: &str, stats: &RunStatistics) {
    println!("=== Run Statistics: {} ===\n", job);

    println!("Items:");
    println!("  Attempted: {}", stats.attempted);
    println!("  Succeeded: {}", stats.succeeded);
    println!("  Failed: {}", stats.failed);
    println!("  Skipped (already done): {}", stats.skipped);
    println!();

    println!("Rows:");
    println!("  Inserted: {}", stats.rows_inserted);
    println!("  Duplicates skipped: {}", stats.rows_skipped_duplicates);
    println!("  Replaced: {}", stats.rows_replaced);
    println!();

    println!(
        "Success Rate: {:.1}% ({} / {} items) in {:.1}s",
        stats.success_rate(),
        stats.succeeded,
        stats.attempted,
        stats.elapsed.as_secs_f64()
    );

    if stats.aborted {
        println!("Run was ABORTED before completing the universe");
    } else if stats.cancelled {
        println!("Run was cancelled; re-run to resume the remaining items");
    }
}

/// Prints the ledger view used by `--stats`
pub fn print_ledger_summary(job: &str, summary: &LedgerSummary, failures: &[CheckpointRecord]) {
    println!("=== Checkpoint Ledger: {} ===\n", job);

    let total = summary.total();
    for status in ItemStatus::all_states() {
        let count = summary.count(status);
        let percentage = if total > 0 {
            (count as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        println!("  {}: {} ({:.1}%)", status, count, percentage);
    }
    println!("  total: {}", total);

    if !failures.is_empty() {
        println!();
        println!("Failed Items ({}):", failures.len());
        for record in failures {
            println!(
                "  - {} (attempts: {}, at {}): {}",
                record.item_id,
                record.attempts,
                record.updated_at.format("%Y-%m-%d %H:%M:%S"),
                record.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }
}

/// Prints location and size of a table
pub fn print_table_info(info: &TableInfo) {
    if !info.exists {
        println!("{}: not created yet ({})", info.table, info.location);
        return;
    }

    println!(
        "{}: {} rows, {:.2} MB at {}",
        info.table,
        info.rows,
        info.size_bytes as f64 / (1024.0 * 1024.0),
        info.location
    );
    if let Some(modified) = info.modified {
        println!("  last modified {}", modified.format("%Y-%m-%d %H:%M:%S"));
    }
}
