use super::{column_error, time_column, PolicyStore, StoreError};
use crate::fingerprint::{ClassificationRecord, HashVersion, RecordOutcome, Verdict};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

/// Everything needed to create a fingerprint record.
#[derive(Debug, Clone)]
pub struct NewClassification {
    pub combined_hash: String,
    pub hash_version: HashVersion,
    pub subject_hash: Option<String>,
    pub body_hash: Option<String>,
    pub sample_subject: String,
    pub sample_body_preview: String,
    pub verdict: Verdict,
    pub initial_count: i64,
    pub first_seen: DateTime<Utc>,
}

fn verdict_column(row: &Row<'_>, index: usize) -> rusqlite::Result<Verdict> {
    let raw: String = row.get(index)?;
    raw.parse().map_err(|e: String| column_error(index, e))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ClassificationRecord> {
    Ok(ClassificationRecord {
        combined_hash: row.get(0)?,
        hash_version: HashVersion::from_i64(row.get(1)?),
        sample_subject: row.get(2)?,
        sample_body_preview: row.get(3)?,
        first_seen: time_column(row, 4)?,
        last_seen: time_column(row, 5)?,
        occurrence_count: row.get(6)?,
        verdict: verdict_column(row, 7)?,
    })
}

impl PolicyStore {
    /// Bump the occurrence count of a known fingerprint and return its
    /// verdict. `None` when the hash is unknown.
    pub fn touch_fingerprint(
        &self,
        combined_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<(Verdict, i64)>, StoreError> {
        let hit = self
            .conn()
            .query_row(
                "UPDATE fingerprints
                 SET occurrence_count = occurrence_count + 1, last_seen = ?2
                 WHERE combined_hash = ?1
                 RETURNING verdict, occurrence_count",
                params![combined_hash, now.to_rfc3339()],
                |row| Ok((verdict_column(row, 0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        Ok(hit)
    }

    pub fn fingerprint(&self, combined_hash: &str) -> Result<Option<ClassificationRecord>, StoreError> {
        let record = self
            .conn()
            .query_row(
                "SELECT combined_hash, hash_version, sample_subject, sample_body_preview,
                        first_seen, last_seen, occurrence_count, verdict
                 FROM fingerprints WHERE combined_hash = ?1",
                params![combined_hash],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Create the record, or bump the count of an existing one and overwrite
    /// its verdict. Each statement is atomic on its own, so concurrent
    /// invocations never lose an increment.
    pub fn upsert_fingerprint(
        &self,
        new: &NewClassification,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome, StoreError> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO fingerprints
                (combined_hash, hash_version, subject_hash, body_hash, sample_subject,
                 sample_body_preview, first_seen, last_seen, occurrence_count, verdict)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                new.combined_hash,
                new.hash_version.as_i64(),
                new.subject_hash,
                new.body_hash,
                new.sample_subject,
                new.sample_body_preview,
                new.first_seen.to_rfc3339(),
                now.to_rfc3339(),
                new.initial_count,
                new.verdict.as_str(),
            ],
        )?;

        if inserted == 1 {
            return Ok(RecordOutcome {
                created: true,
                occurrence_count: new.initial_count,
            });
        }

        let occurrence_count: i64 = self.conn().query_row(
            "UPDATE fingerprints
             SET occurrence_count = occurrence_count + 1, last_seen = ?2, verdict = ?3
             WHERE combined_hash = ?1
             RETURNING occurrence_count",
            params![new.combined_hash, now.to_rfc3339(), new.verdict.as_str()],
            |row| row.get(0),
        )?;

        Ok(RecordOutcome {
            created: false,
            occurrence_count,
        })
    }

    /// Returns false when no record has this hash.
    pub fn set_verdict(&self, combined_hash: &str, verdict: Verdict) -> Result<bool, StoreError> {
        let changed = self.conn().execute(
            "UPDATE fingerprints SET verdict = ?2 WHERE combined_hash = ?1",
            params![combined_hash, verdict.as_str()],
        )?;
        Ok(changed > 0)
    }

    pub fn remove_fingerprint(&self, combined_hash: &str) -> Result<bool, StoreError> {
        let removed = self.conn().execute(
            "DELETE FROM fingerprints WHERE combined_hash = ?1",
            params![combined_hash],
        )?;
        Ok(removed > 0)
    }

    /// Number of records per verdict.
    pub fn fingerprint_counts(&self) -> Result<Vec<(Verdict, i64)>, StoreError> {
        let mut stmt = self
            .conn()
            .prepare("SELECT verdict, COUNT(*) FROM fingerprints GROUP BY verdict ORDER BY verdict")?;
        let rows = stmt.query_map([], |row| Ok((verdict_column(row, 0)?, row.get(1)?)))?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classification(hash: &str, verdict: Verdict) -> NewClassification {
        NewClassification {
            combined_hash: hash.to_string(),
            hash_version: HashVersion::V1,
            subject_hash: Some("s".to_string()),
            body_hash: Some("b".to_string()),
            sample_subject: "Subject".to_string(),
            sample_body_preview: "Body".to_string(),
            verdict,
            initial_count: 1,
            first_seen: Utc::now(),
        }
    }

    #[test]
    fn test_touch_unknown_is_none() {
        let store = PolicyStore::open_in_memory().unwrap();
        assert_eq!(store.touch_fingerprint("v1:nope", Utc::now()).unwrap(), None);
    }

    #[test]
    fn test_upsert_then_touch_counts() {
        let store = PolicyStore::open_in_memory().unwrap();
        let now = Utc::now();
        let created = store.upsert_fingerprint(&classification("v1:a", Verdict::Spam), now).unwrap();
        assert!(created.created);

        let hit = store.touch_fingerprint("v1:a", now).unwrap();
        assert_eq!(hit, Some((Verdict::Spam, 2)));

        let again = store.upsert_fingerprint(&classification("v1:a", Verdict::Clean), now).unwrap();
        assert!(!again.created);
        assert_eq!(again.occurrence_count, 3);

        let record = store.fingerprint("v1:a").unwrap().unwrap();
        assert_eq!(record.verdict, Verdict::Clean);
        assert_eq!(record.occurrence_count, 3);
        assert_eq!(record.sample_subject, "Subject");
    }

    #[test]
    fn test_initial_count_is_kept_on_insert() {
        let store = PolicyStore::open_in_memory().unwrap();
        let mut new = classification("v1:m", Verdict::Spam);
        new.initial_count = 5;
        let outcome = store.upsert_fingerprint(&new, Utc::now()).unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.occurrence_count, 5);
    }

    #[test]
    fn test_set_verdict_and_remove() {
        let store = PolicyStore::open_in_memory().unwrap();
        store
            .upsert_fingerprint(&classification("v1:x", Verdict::Spam), Utc::now())
            .unwrap();
        assert!(store.set_verdict("v1:x", Verdict::Clean).unwrap());
        assert!(!store.set_verdict("v1:y", Verdict::Clean).unwrap());
        assert_eq!(store.fingerprint_counts().unwrap(), vec![(Verdict::Clean, 1)]);
        assert!(store.remove_fingerprint("v1:x").unwrap());
        assert!(store.fingerprint("v1:x").unwrap().is_none());
    }
}
