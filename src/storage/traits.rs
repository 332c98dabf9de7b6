//! Storage traits and error types
//!
//! This module defines the trait interface shared by the CSV and SQLite
//! backends and the error type they report.

use crate::config::StorageType;
use crate::storage::{AppendOutcome, Record, RowFilter, TableInfo, UniqueKey};
use rusqlite::ErrorCode;
use std::io::ErrorKind;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("Record for table {table} is missing key column {column}")]
    MissingKeyColumn { table: String, column: String },

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl StorageError {
    /// Returns true for contention that a later attempt may not hit
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => {
                matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            }
            Self::Pool(_) => true,
            Self::Io(e) => is_transient_io(e.kind()),
            Self::Csv(e) => match e.kind() {
                csv::ErrorKind::Io(io) => is_transient_io(io.kind()),
                _ => false,
            },
            _ => false,
        }
    }

    /// Returns true when the medium itself is unusable
    ///
    /// Fatal errors (unreadable or unwritable files, a corrupt or read-only
    /// database, a full disk) abort the run. Everything else is caused by one
    /// item's rows or by contention and fails that item only.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::CannotOpen
                    | ErrorCode::ReadOnly
                    | ErrorCode::NotADatabase
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::PermissionDenied
                    | ErrorCode::DiskFull
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::FileLockingProtocolFailed
            ),
            Self::Io(e) => is_fatal_io(e.kind()),
            Self::Csv(e) => match e.kind() {
                csv::ErrorKind::Io(io) => is_fatal_io(io.kind()),
                _ => false,
            },
            _ => false,
        }
    }
}

fn is_transient_io(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock
    )
}

/// Unexpected IO failures count as fatal; malformed input does not
fn is_fatal_io(kind: ErrorKind) -> bool {
    !is_transient_io(kind)
        && !matches!(
            kind,
            ErrorKind::InvalidData | ErrorKind::InvalidInput | ErrorKind::UnexpectedEof
        )
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for storage backend implementations
///
/// Implementations are shared by every worker of a run, so all operations take
/// `&self` and serialize internally where the medium requires it.
pub trait RecordStore: Send + Sync {
    /// Which backend this is
    fn kind(&self) -> StorageType;

    /// Writes `records` unconditionally, creating the table if needed
    ///
    /// # Returns
    ///
    /// The number of rows written
    fn save(&self, records: &[Record], table: &str) -> StorageResult<usize>;

    /// Merges `records` into `table`, keeping at most one row per `key` value
    ///
    /// Existing rows with a matching key are skipped or overwritten according
    /// to the store's [`DuplicatePolicy`](crate::storage::DuplicatePolicy);
    /// duplicates within `records` are resolved the same way.
    fn append_deduplicated(
        &self,
        records: &[Record],
        table: &str,
        key: &UniqueKey,
    ) -> StorageResult<AppendOutcome>;

    /// Reads every row of `table` matching `filter`; a missing table yields no rows
    fn read(&self, table: &str, filter: &RowFilter) -> StorageResult<Vec<Record>>;

    /// Checks whether `table` has been created
    fn exists(&self, table: &str) -> StorageResult<bool>;

    /// Reports location, size and row count of `table`
    fn describe(&self, table: &str) -> StorageResult<TableInfo>;

    /// Copies `table` aside with a timestamp suffix
    fn backup(&self, table: &str) -> StorageResult<PathBuf> {
        Err(StorageError::Unsupported(format!(
            "backup of {} is not supported by the {:?} backend",
            table,
            self.kind()
        )))
    }
}
