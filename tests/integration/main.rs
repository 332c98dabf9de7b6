//! Integration tests for xq-harvest
//!
//! These tests use wiremock to stand in for the quote API and tempfile
//! directories for CSV, SQLite and ledger state, and drive full runs
//! end-to-end.

mod common;
mod harvest_tests;
mod session_tests;
