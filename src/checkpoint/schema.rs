//! Checkpoint ledger schema

use rusqlite::Connection;

/// SQL schema for the ledger database
pub const SCHEMA_SQL: &str = r#"
-- One row per item per job
CREATE TABLE IF NOT EXISTS checkpoints (
    job TEXT NOT NULL,
    item_id TEXT NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (job, item_id)
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_status ON checkpoints(job, status);
"#;

/// Initializes the ledger schema
pub fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)
}
