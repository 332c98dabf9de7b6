//! Storage module for persisting harvested records
//!
//! Two interchangeable backends sit behind the [`RecordStore`] trait:
//! - [`CsvStore`]: one CSV file per table, chunked reads and writes
//! - [`SqliteStore`]: a pooled SQLite database with per-batch upsert transactions
//!
//! Both guarantee at most one row per unique-key value per table.

mod csv_file;
mod schema;
mod sqlite;
mod traits;

pub use csv_file::CsvStore;
pub use sqlite::SqliteStore;
pub use traits::{RecordStore, StorageError, StorageResult};

use crate::config::{StorageConfig, StorageType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::sync::Arc;

/// One normalized row: ordered column name to JSON scalar
pub type Record = Map<String, Value>;

/// Opens the backend selected by `storage.type`
///
/// # Returns
///
/// * `Ok(Arc<dyn RecordStore>)` - A store shared by every worker of a run
/// * `Err(StorageError)` - The backing directory or database could not be opened
pub fn open_storage(config: &StorageConfig) -> StorageResult<Arc<dyn RecordStore>> {
    match config.storage_type {
        StorageType::File => Ok(Arc::new(CsvStore::new(config)?)),
        StorageType::Relational => Ok(Arc::new(SqliteStore::new(config)?)),
    }
}

/// What happens when an incoming record's key already exists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Keep the stored row; first write wins
    #[default]
    Skip,
    /// Replace the stored row with the incoming one
    Overwrite,
}

/// Columns whose combined value identifies a row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueKey {
    columns: Vec<String>,
}

impl UniqueKey {
    pub fn new<S: AsRef<str>>(columns: &[S]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.as_ref().to_string()).collect(),
        }
    }

    pub fn single(column: &str) -> Self {
        Self::new(&[column])
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Renders the key of `record` in the canonical text form used for comparison
    ///
    /// Fails if any key column is absent or null; such a row could never be
    /// deduplicated.
    pub fn render(&self, table: &str, record: &Record) -> StorageResult<Vec<String>> {
        self.columns
            .iter()
            .map(|column| match record.get(column) {
                None | Some(Value::Null) => Err(StorageError::MissingKeyColumn {
                    table: table.to_string(),
                    column: column.clone(),
                }),
                Some(value) => Ok(render_cell(value)),
            })
            .collect()
    }
}

/// Conjunction of column equalities; empty matches every row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowFilter {
    conditions: Vec<(String, Value)>,
}

impl RowFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((column.into(), value.into()));
        self
    }

    pub fn conditions(&self) -> &[(String, Value)] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Compares in rendered text form so CSV round-trips still match
    pub fn matches(&self, record: &Record) -> bool {
        self.conditions.iter().all(|(column, expected)| {
            record
                .get(column)
                .map(|actual| render_cell(actual) == render_cell(expected))
                .unwrap_or(false)
        })
    }
}

/// Counts returned by [`RecordStore::append_deduplicated`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    pub inserted: usize,
    pub skipped_duplicates: usize,
    /// Stored rows replaced under [`DuplicatePolicy::Overwrite`]
    pub replaced: usize,
}

/// Location and size of one logical table
#[derive(Debug, Clone, PartialEq)]
pub struct TableInfo {
    pub table: String,
    pub exists: bool,
    pub rows: u64,
    pub size_bytes: u64,
    pub location: String,
    pub modified: Option<DateTime<Utc>>,
}

/// Renders a JSON scalar the way it is written to a CSV cell
pub fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Infers a JSON scalar from CSV cell text
///
/// Numbers are only inferred when they render back to the same text, so codes
/// with leading zeros (`000001`) stay strings.
pub fn coerce_cell(s: &str) -> Value {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }

    if trimmed == "true" {
        return Value::Bool(true);
    }
    if trimmed == "false" {
        return Value::Bool(false);
    }

    if let Ok(i) = trimmed.parse::<i64>() {
        if i.to_string() == trimmed {
            return Value::Number(i.into());
        }
    }

    if let Ok(f) = trimmed.parse::<f64>() {
        if let Some(n) = Number::from_f64(f) {
            if n.to_string() == trimmed {
                return Value::Number(n);
            }
        }
    }

    Value::String(s.to_string())
}

/// Ordered union of the columns of `records`, first appearance first
pub(crate) fn collect_columns<'a>(records: impl IntoIterator<Item = &'a Record>) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for record in records {
        for column in record.keys() {
            if !columns.iter().any(|c| c == column) {
                columns.push(column.clone());
            }
        }
    }
    columns
}
