//! SQLite-backed checkpoint ledger

use crate::checkpoint::schema::initialize_schema;
use crate::checkpoint::LedgerSummary;
use crate::state::{CheckpointRecord, ItemDescriptor, ItemStatus, Universe};
use crate::storage::{StorageError, StorageResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Durable per-item progress for one job
///
/// A job is one endpoint kind with its parameters (for example
/// `kline:day:after`), so the same symbol is tracked independently per job.
pub struct CheckpointLedger {
    conn: Mutex<Connection>,
    job: String,
}

impl CheckpointLedger {
    /// Opens (or creates) the ledger database and scopes it to `job`
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite ledger file
    /// * `job` - Job name every record of this instance is filed under
    pub fn open(path: &Path, job: &str) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // Each update must survive a crash on its own
        conn.execute_batch(
            "
            PRAGMA busy_timeout = 5000;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
        ",
        )?;
        initialize_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            job: job.to_string(),
        })
    }

    /// Creates an in-memory ledger (for testing)
    #[cfg(test)]
    pub fn new_in_memory(job: &str) -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            job: job.to_string(),
        })
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Loads every record of the job
    ///
    /// Records left `in_progress` by an interrupted run are reclassified as
    /// `pending` first, both on disk and in the returned map.
    pub fn load(&self) -> StorageResult<HashMap<String, CheckpointRecord>> {
        let conn = self.lock();

        let recovered = conn.execute(
            "UPDATE checkpoints SET status = ?1, updated_at = ?2 WHERE job = ?3 AND status = ?4",
            params![
                ItemStatus::Pending.to_db_string(),
                Utc::now().to_rfc3339(),
                self.job,
                ItemStatus::InProgress.to_db_string()
            ],
        )?;
        if recovered > 0 {
            tracing::warn!(
                job = %self.job,
                count = recovered,
                "Reclassified interrupted items as pending"
            );
        }

        let mut stmt = conn.prepare(
            "SELECT item_id, status, attempts, last_error, updated_at
             FROM checkpoints WHERE job = ?1",
        )?;
        let records = stmt
            .query_map(params![self.job], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records
            .into_iter()
            .map(|r| (r.item_id.clone(), r))
            .collect())
    }

    /// Gets the record of one item
    pub fn record(&self, item_id: &str) -> StorageResult<Option<CheckpointRecord>> {
        let conn = self.lock();
        let record = conn
            .query_row(
                "SELECT item_id, status, attempts, last_error, updated_at
                 FROM checkpoints WHERE job = ?1 AND item_id = ?2",
                params![self.job, item_id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Returns the items of `universe` that are not done, in universe order
    ///
    /// Items seen for the first time get a `pending` record.
    pub fn pending_items(&self, universe: &Universe) -> StorageResult<Vec<ItemDescriptor>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let statuses: HashMap<String, ItemStatus> = {
            let mut stmt = tx.prepare("SELECT item_id, status FROM checkpoints WHERE job = ?1")?;
            let rows = stmt
                .query_map(params![self.job], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(id, status)| {
                    (
                        id,
                        ItemStatus::from_db_string(&status).unwrap_or(ItemStatus::Pending),
                    )
                })
                .collect()
        };

        let now = Utc::now().to_rfc3339();
        let mut pending = Vec::new();
        {
            let mut insert = tx.prepare(
                "INSERT OR IGNORE INTO checkpoints (job, item_id, status, attempts, updated_at)
                 VALUES (?1, ?2, ?3, 0, ?4)",
            )?;
            for item in universe.items() {
                match statuses.get(&item.id) {
                    Some(status) if !status.is_retryable() => {}
                    Some(_) => pending.push(item.clone()),
                    None => {
                        insert.execute(params![
                            self.job,
                            item.id,
                            ItemStatus::Pending.to_db_string(),
                            now
                        ])?;
                        pending.push(item.clone());
                    }
                }
            }
        }
        tx.commit()?;

        Ok(pending)
    }

    /// Claims an item for a worker and counts the attempt
    pub fn mark_in_progress(&self, item_id: &str) -> StorageResult<()> {
        self.transition(item_id, ItemStatus::InProgress, None)
    }

    pub fn mark_done(&self, item_id: &str) -> StorageResult<()> {
        self.transition(item_id, ItemStatus::Done, None)
    }

    pub fn mark_failed(&self, item_id: &str, error: &str) -> StorageResult<()> {
        self.transition(item_id, ItemStatus::Failed, Some(error))
    }

    fn transition(
        &self,
        item_id: &str,
        next: ItemStatus,
        error: Option<&str>,
    ) -> StorageResult<()> {
        let conn = self.lock();

        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM checkpoints WHERE job = ?1 AND item_id = ?2",
                params![self.job, item_id],
                |row| row.get(0),
            )
            .optional()?;
        let current = current
            .as_deref()
            .and_then(ItemStatus::from_db_string)
            .unwrap_or(ItemStatus::Pending);

        if !current.can_transition_to(next) {
            return Err(StorageError::ConstraintViolation(format!(
                "item {} of job {} cannot move from {} to {}",
                item_id, self.job, current, next
            )));
        }

        let now = Utc::now().to_rfc3339();
        match next {
            ItemStatus::InProgress => conn.execute(
                "INSERT INTO checkpoints (job, item_id, status, attempts, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4)
                 ON CONFLICT(job, item_id) DO UPDATE SET
                    status = excluded.status,
                    attempts = attempts + 1,
                    updated_at = excluded.updated_at",
                params![self.job, item_id, next.to_db_string(), now],
            )?,
            _ => conn.execute(
                "INSERT INTO checkpoints (job, item_id, status, attempts, last_error, updated_at)
                 VALUES (?1, ?2, ?3, 0, ?4, ?5)
                 ON CONFLICT(job, item_id) DO UPDATE SET
                    status = excluded.status,
                    last_error = excluded.last_error,
                    updated_at = excluded.updated_at",
                params![self.job, item_id, next.to_db_string(), error, now],
            )?,
        };

        tracing::trace!(job = %self.job, item = item_id, status = %next, "Checkpoint updated");
        Ok(())
    }

    /// Re-opens the given items as pending (force refresh)
    pub fn reset<'a>(&self, item_ids: impl IntoIterator<Item = &'a str>) -> StorageResult<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE checkpoints SET status = ?1, last_error = NULL, updated_at = ?2
                 WHERE job = ?3 AND item_id = ?4",
            )?;
            for item_id in item_ids {
                count += stmt.execute(params![
                    ItemStatus::Pending.to_db_string(),
                    now,
                    self.job,
                    item_id
                ])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    /// Re-opens every item of the job as pending
    pub fn reset_all(&self) -> StorageResult<usize> {
        let conn = self.lock();
        let count = conn.execute(
            "UPDATE checkpoints SET status = ?1, last_error = NULL, updated_at = ?2 WHERE job = ?3",
            params![
                ItemStatus::Pending.to_db_string(),
                Utc::now().to_rfc3339(),
                self.job
            ],
        )?;
        Ok(count)
    }

    /// Counts items per status
    pub fn summary(&self) -> StorageResult<LedgerSummary> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM checkpoints WHERE job = ?1 GROUP BY status")?;
        let rows = stmt
            .query_map(params![self.job], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut summary = LedgerSummary::default();
        for (status, count) in rows {
            if let Some(status) = ItemStatus::from_db_string(&status) {
                summary.add(status, count as u64);
            }
        }
        Ok(summary)
    }

    /// Failed items with their last error, oldest first
    pub fn failures(&self) -> StorageResult<Vec<CheckpointRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT item_id, status, attempts, last_error, updated_at
             FROM checkpoints WHERE job = ?1 AND status = ?2 ORDER BY updated_at",
        )?;
        let records = stmt
            .query_map(
                params![self.job, ItemStatus::Failed.to_db_string()],
                row_to_record,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<CheckpointRecord> {
    let status: String = row.get(1)?;
    let updated_at: String = row.get(4)?;
    Ok(CheckpointRecord {
        item_id: row.get(0)?,
        status: ItemStatus::from_db_string(&status).unwrap_or(ItemStatus::Pending),
        attempts: row.get(2)?,
        last_error: row.get(3)?,
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}
