use super::{PolicyStore, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::time::Duration;

impl PolicyStore {
    /// Value stored under `key`, unless it has expired.
    pub fn cache_get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>, StoreError> {
        let value = self
            .conn()
            .query_row(
                "SELECT value FROM kv_cache WHERE key = ?1 AND expires_at > ?2",
                params![key, now.timestamp()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn cache_put(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let expires_at = now.timestamp().saturating_add(ttl);
        self.conn().execute(
            "INSERT INTO kv_cache (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            params![key, value, expires_at],
        )?;
        Ok(())
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let removed = self
            .conn()
            .execute("DELETE FROM kv_cache WHERE expires_at <= ?1", params![now.timestamp()])?;
        Ok(removed)
    }
}
