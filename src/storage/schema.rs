//! Dynamic schema management for the relational backend
//!
//! Tables are created from the columns of the first batch written to them and
//! widened with `ALTER TABLE ... ADD COLUMN` when later batches carry new
//! columns. Column types are left undeclared so SQLite stores each value with
//! its own storage class.

use crate::storage::traits::{StorageError, StorageResult};
use crate::storage::UniqueKey;
use rusqlite::Connection;

/// Validates a table or column name and returns it double-quoted
///
/// Names come from endpoint definitions and payload field names, so only a
/// conservative character set is accepted.
pub fn quote_identifier(name: &str) -> StorageResult<String> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());

    if !valid {
        return Err(StorageError::InvalidIdentifier(name.to_string()));
    }

    Ok(format!("\"{}\"", name))
}

/// Returns the column names of `table`, empty if it does not exist
pub fn table_columns(conn: &Connection, table: &str) -> StorageResult<Vec<String>> {
    let quoted = quote_identifier(table)?;
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quoted))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

pub fn table_exists(conn: &Connection, table: &str) -> StorageResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Creates `table` or adds the columns it is missing
pub fn ensure_table(conn: &Connection, table: &str, columns: &[String]) -> StorageResult<()> {
    let quoted_table = quote_identifier(table)?;
    let existing = table_columns(conn, table)?;

    if existing.is_empty() {
        if columns.is_empty() {
            return Err(StorageError::ConstraintViolation(format!(
                "cannot create table {} without columns",
                table
            )));
        }
        let column_defs = columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<StorageResult<Vec<_>>>()?
            .join(", ");
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quoted_table, column_defs
        ))?;
        tracing::debug!(table, columns = columns.len(), "Created table");
        return Ok(());
    }

    for column in columns {
        if !existing.iter().any(|e| e == column) {
            conn.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {}",
                quoted_table,
                quote_identifier(column)?
            ))?;
            tracing::debug!(table, column = %column, "Added column");
        }
    }

    Ok(())
}

/// Name of the unique index backing `key` on `table`
pub fn unique_index_name(table: &str, key: &UniqueKey) -> String {
    format!("ux_{}_{}", table, key.columns().join("_"))
}

/// Creates the UNIQUE index that upserts on `table` conflict against
pub fn ensure_unique_index(conn: &Connection, table: &str, key: &UniqueKey) -> StorageResult<()> {
    let key_columns = key
        .columns()
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<StorageResult<Vec<_>>>()?
        .join(", ");

    conn.execute_batch(&format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
        quote_identifier(&unique_index_name(table, key))?,
        quote_identifier(table)?,
        key_columns
    ))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("kline_data").unwrap(), "\"kline_data\"");
        assert!(quote_identifier("").is_err());
        assert!(quote_identifier("bad name").is_err());
        assert!(quote_identifier("x\"; DROP TABLE y; --").is_err());
        assert!(quote_identifier("1abc").is_err());
    }

    #[test]
    fn test_ensure_table_creates_and_widens() {
        let conn = Connection::open_in_memory().unwrap();

        assert!(!table_exists(&conn, "quotes").unwrap());
        ensure_table(&conn, "quotes", &strings(&["symbol", "close"])).unwrap();
        assert!(table_exists(&conn, "quotes").unwrap());
        assert_eq!(table_columns(&conn, "quotes").unwrap(), strings(&["symbol", "close"]));

        ensure_table(&conn, "quotes", &strings(&["symbol", "volume"])).unwrap();
        assert_eq!(
            table_columns(&conn, "quotes").unwrap(),
            strings(&["symbol", "close", "volume"])
        );
    }

    #[test]
    fn test_unique_index_rejects_duplicates() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_table(&conn, "t", &strings(&["key", "value"])).unwrap();
        ensure_unique_index(&conn, "t", &UniqueKey::single("key")).unwrap();

        conn.execute(r#"INSERT INTO t ("key", "value") VALUES ('X1', 1)"#, [])
            .unwrap();
        let dup = conn.execute(r#"INSERT INTO t ("key", "value") VALUES ('X1', 2)"#, []);
        assert!(dup.is_err());
    }
}
