//! Durable relational record of tapes, pools, drives, jobs, sources, backup
//! sets, per-file catalog entries, snapshots, job executions, spanning sets
//! and tape-change requests.
//!
//! Backed by `rusqlite` in WAL mode. calls for "concurrent
//! readers and writers with row-level concurrency provided by the
//! underlying relational store"; SQLite's own `busy_timeout` plus WAL mode
//! gives us that without a server process. The single `Mutex<Connection>`
//! serializes writers at the process level, which is the same trade-off the
//! teacher's `pbs-config` module makes with its `open_backup_lockfile`
//! file-lock around section-config writes.

mod entries;
mod jobs;
mod schema;
mod spanning;
mod tapes;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use thiserror::Error;

pub use tbe_types::*;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid enum value {value:?} for {field}")]
    InvalidEnum { field: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, CatalogError>;

/// Handle to the catalog database. Cheap to clone (wraps an `Arc`-free
/// `Mutex` behind a reference the caller owns); callers never hold the lock
/// across external I/O .
pub struct CatalogStore {
    conn: Mutex<Connection>,
}

impl CatalogStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        conn.execute_batch(schema::SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(schema::SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn audit(&self, category: &str, message: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO audit_log (at, category, message) VALUES (?1, ?2, ?3)",
            rusqlite::params![now(), category, message],
        )?;
        Ok(())
    }
}

pub(crate) fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Helper macro-like functions for enum <-> TEXT column round trips. Each
/// enum stores its serde `snake_case` representation directly so the
/// column value is human-readable in `sqlite3` without a lookup table.
pub(crate) fn enum_to_text<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_value(value).expect("enum serialization cannot fail") {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

pub(crate) fn text_to_enum<T: serde::de::DeserializeOwned>(
    field: &'static str,
    text: &str,
) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(text.to_string())).map_err(|_| {
        CatalogError::InvalidEnum {
            field,
            value: text.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn test_store() -> CatalogStore {
        CatalogStore::open_in_memory().unwrap()
    }

    #[test]
    fn schema_creates_cleanly() {
        let _store = test_store();
    }

    #[test]
    fn audit_log_records_entries() {
        let store = test_store();
        store.audit("test", "hello").unwrap();
    }
}
