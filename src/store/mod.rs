//! Policy Store
//!
//! SQLite database shared by every invocation: fingerprints, detection rules,
//! a key/value cache with expiry and named counters. Several filter processes
//! write concurrently, so counters are only ever changed by single atomic
//! statements and lock contention is retried for `busy_timeout`.

mod cache;
mod fingerprints;
mod rules;

pub use fingerprints::NewClassification;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("policy database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("failed to create policy store directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt value in policy store: {0}")]
    Corrupt(String),
}

pub struct PolicyStore {
    conn: Connection,
}

impl PolicyStore {
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Directory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        // WAL lets readers proceed while another invocation writes.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self { conn };
        store.init_schema()?;
        log::debug!("Opened policy store {}", path.display());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS fingerprints (
                combined_hash TEXT PRIMARY KEY,
                hash_version INTEGER NOT NULL DEFAULT 1,
                subject_hash TEXT,
                body_hash TEXT,
                sample_subject TEXT NOT NULL DEFAULT '',
                sample_body_preview TEXT NOT NULL DEFAULT '',
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                occurrence_count INTEGER NOT NULL DEFAULT 1,
                verdict TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS detection_algorithms (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                server_id TEXT UNIQUE,
                name TEXT NOT NULL,
                category TEXT NOT NULL,
                detection_type TEXT NOT NULL,
                target TEXT NOT NULL DEFAULT 'subject,body',
                pattern TEXT NOT NULL,
                score INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                priority INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_detection_algorithms_category
                ON detection_algorithms (category, enabled, priority);

            CREATE TABLE IF NOT EXISTS kv_cache (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS stats (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL DEFAULT 0
            );",
        )?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

/// Read an RFC 3339 timestamp column.
pub(crate) fn time_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| column_error(index, format!("timestamp '{raw}': {e}")))
}

/// Map a conversion failure inside a row closure to a rusqlite error.
pub(crate) fn column_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(StoreError::Corrupt(message)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_directories_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("policy.db");
        let store = PolicyStore::open(&path, Duration::from_millis(500)).unwrap();
        assert!(path.exists());

        let tables: i64 = store
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('fingerprints', 'detection_algorithms', 'kv_cache', 'stats')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);

        // Re-opening an existing database is harmless.
        drop(store);
        PolicyStore::open(&path, Duration::from_millis(500)).unwrap();
    }
}
