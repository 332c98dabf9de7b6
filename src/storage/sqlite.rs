//! SQLite storage implementation
//!
//! This module provides the relational implementation of the RecordStore
//! trait. Connections come from a bounded r2d2 pool; every batch runs in a
//! single transaction so a failure leaves the table untouched.

use crate::config::{StorageConfig, StorageType};
use crate::storage::schema::{
    ensure_table, ensure_unique_index, quote_identifier, table_columns, table_exists,
};
use crate::storage::traits::{RecordStore, StorageError, StorageResult};
use crate::storage::{
    collect_columns, AppendOutcome, DuplicatePolicy, Record, RowFilter, TableInfo, UniqueKey,
};
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, ErrorCode};
use serde_json::{Number, Value};
use std::path::{Path, PathBuf};

/// Pooled SQLite storage backend
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
    policy: DuplicatePolicy,
}

impl SqliteStore {
    /// Opens the database named by `storage.database-path`
    pub fn new(config: &StorageConfig) -> StorageResult<Self> {
        Self::open(
            Path::new(&config.database_path),
            config.pool_size,
            config.pool_max_size,
            config.duplicate_policy,
        )
    }

    /// Opens (or creates) a database file behind a pool of `min_idle..=max_size` connections
    pub fn open(
        path: &Path,
        min_idle: u32,
        max_size: u32,
        policy: DuplicatePolicy,
    ) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "
                PRAGMA busy_timeout = 5000;
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA temp_store = MEMORY;
            ",
            )
        });

        let pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(min_idle.min(max_size)))
            .build(manager)?;

        tracing::debug!(path = %path.display(), min_idle, max_size, "Opened SQLite pool");

        Ok(Self {
            pool,
            path: path.to_path_buf(),
            policy,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn insert_sql(table: &str, columns: &[String]) -> StorageResult<String> {
        let quoted = columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<StorageResult<Vec<_>>>()?;
        let placeholders = (1..=columns.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        Ok(format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_identifier(table)?,
            quoted.join(", "),
            placeholders
        ))
    }

    fn upsert_sql(&self, table: &str, columns: &[String], key: &UniqueKey) -> StorageResult<String> {
        let insert = Self::insert_sql(table, columns)?;
        let target = key
            .columns()
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<StorageResult<Vec<_>>>()?
            .join(", ");

        let updates = columns
            .iter()
            .filter(|c| !key.columns().contains(*c))
            .map(|c| quote_identifier(c).map(|q| format!("{q} = excluded.{q}")))
            .collect::<StorageResult<Vec<_>>>()?;

        let action = match self.policy {
            DuplicatePolicy::Overwrite if !updates.is_empty() => {
                format!("DO UPDATE SET {}", updates.join(", "))
            }
            _ => "DO NOTHING".to_string(),
        };

        Ok(format!("{} ON CONFLICT ({}) {}", insert, target, action))
    }

    fn key_lookup_sql(table: &str, key: &UniqueKey) -> StorageResult<String> {
        let conditions = key
            .columns()
            .iter()
            .enumerate()
            .map(|(i, c)| quote_identifier(c).map(|q| format!("{} = ?{}", q, i + 1)))
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(format!(
            "SELECT 1 FROM {} WHERE {} LIMIT 1",
            quote_identifier(table)?,
            conditions.join(" AND ")
        ))
    }
}

/// Maps a JSON scalar to the SQLite storage class it is written as
fn to_sql_value(value: Option<&Value>) -> SqlValue {
    match value {
        None | Some(Value::Null) => SqlValue::Null,
        Some(Value::Bool(b)) => SqlValue::Integer(i64::from(*b)),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Some(Value::String(s)) => SqlValue::Text(s.clone()),
        Some(other) => SqlValue::Text(other.to_string()),
    }
}

fn from_sql_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(hex::encode(b)),
    }
}

/// Surfaces UNIQUE/NOT NULL failures as constraint violations
fn classify(err: rusqlite::Error) -> StorageError {
    match &err {
        rusqlite::Error::SqliteFailure(e, msg) if e.code == ErrorCode::ConstraintViolation => {
            StorageError::ConstraintViolation(msg.clone().unwrap_or_else(|| e.to_string()))
        }
        _ => StorageError::Sqlite(err),
    }
}

impl RecordStore for SqliteStore {
    fn kind(&self) -> StorageType {
        StorageType::Relational
    }

    fn save(&self, records: &[Record], table: &str) -> StorageResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let columns = collect_columns(records);
        let sql = Self::insert_sql(table, &columns)?;

        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        ensure_table(&tx, table, &columns)?;
        {
            let mut stmt = tx.prepare(&sql)?;
            for record in records {
                stmt.execute(params_from_iter(
                    columns.iter().map(|c| to_sql_value(record.get(c))),
                ))
                .map_err(classify)?;
            }
        }
        tx.commit()?;

        tracing::debug!(table, rows = records.len(), "Saved rows");
        Ok(records.len())
    }

    fn append_deduplicated(
        &self,
        records: &[Record],
        table: &str,
        key: &UniqueKey,
    ) -> StorageResult<AppendOutcome> {
        let mut outcome = AppendOutcome::default();
        if records.is_empty() {
            return Ok(outcome);
        }

        for record in records {
            key.render(table, record)?;
        }

        let columns = collect_columns(records);
        let upsert = self.upsert_sql(table, &columns, key)?;
        let lookup = Self::key_lookup_sql(table, key)?;

        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        ensure_table(&tx, table, &columns)?;
        ensure_unique_index(&tx, table, key)?;
        {
            let mut upsert_stmt = tx.prepare(&upsert)?;
            let mut lookup_stmt = tx.prepare(&lookup)?;

            for record in records {
                let existed = match self.policy {
                    DuplicatePolicy::Overwrite => lookup_stmt.exists(params_from_iter(
                        key.columns().iter().map(|c| to_sql_value(record.get(c))),
                    ))?,
                    DuplicatePolicy::Skip => false,
                };

                let changed = upsert_stmt
                    .execute(params_from_iter(
                        columns.iter().map(|c| to_sql_value(record.get(c))),
                    ))
                    .map_err(classify)?;

                match (self.policy, existed, changed) {
                    (DuplicatePolicy::Overwrite, true, _) => outcome.replaced += 1,
                    (_, _, 0) => outcome.skipped_duplicates += 1,
                    _ => outcome.inserted += 1,
                }
            }
        }
        tx.commit()?;

        tracing::debug!(
            table,
            inserted = outcome.inserted,
            skipped = outcome.skipped_duplicates,
            replaced = outcome.replaced,
            "Merged batch"
        );
        Ok(outcome)
    }

    fn read(&self, table: &str, filter: &RowFilter) -> StorageResult<Vec<Record>> {
        let conn = self.pool.get()?;
        if !table_exists(&conn, table)? {
            return Ok(Vec::new());
        }

        let columns = table_columns(&conn, table)?;
        if filter
            .conditions()
            .iter()
            .any(|(column, _)| !columns.contains(column))
        {
            return Ok(Vec::new());
        }

        let mut sql = format!("SELECT * FROM {}", quote_identifier(table)?);
        if !filter.is_empty() {
            let conditions = filter
                .conditions()
                .iter()
                .enumerate()
                .map(|(i, (c, _))| quote_identifier(c).map(|q| format!("{} = ?{}", q, i + 1)))
                .collect::<StorageResult<Vec<_>>>()?;
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY rowid");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params_from_iter(filter.conditions().iter().map(|(_, v)| to_sql_value(Some(v)))),
                |row| {
                    let mut record = Record::new();
                    for (i, column) in columns.iter().enumerate() {
                        record.insert(column.clone(), from_sql_value(row.get_ref(i)?));
                    }
                    Ok(record)
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    fn exists(&self, table: &str) -> StorageResult<bool> {
        let conn = self.pool.get()?;
        table_exists(&conn, table)
    }

    fn describe(&self, table: &str) -> StorageResult<TableInfo> {
        let conn = self.pool.get()?;
        let exists = table_exists(&conn, table)?;
        let rows = if exists {
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", quote_identifier(table)?),
                [],
                |row| row.get(0),
            )?;
            count as u64
        } else {
            0
        };

        let metadata = std::fs::metadata(&self.path).ok();
        Ok(TableInfo {
            table: table.to_string(),
            exists,
            rows,
            size_bytes: metadata.as_ref().map(|m| m.len()).unwrap_or(0),
            location: format!("{}#{}", self.path.display(), table),
            modified: metadata
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from),
        })
    }
}
