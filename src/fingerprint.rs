//! Fingerprint Classifier
//!
//! Version 1 fingerprints are keyed and scoped to the calendar date: the
//! subject and body digests are chained through a keyed hash and the result is
//! keyed again with the date. The same content therefore produces a different
//! fingerprint on a different day. Legacy fingerprints (one unkeyed digest of
//! subject and body) are still recognised and migrated on first match.

use crate::store::{NewClassification, PolicyStore, StoreError};
use chrono::{DateTime, NaiveDate, Utc};
use hmac::{Hmac, Mac};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

type HmacSha256 = Hmac<Sha256>;

lazy_static! {
    static ref HTML_TAG: Regex = Regex::new(r"<[^>]*>").unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

const V1_PREFIX: &str = "v1:";

#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error("fingerprint key rejected by HMAC")]
    Key,
    #[error(transparent)]
    Store(#[from] StoreError),
}
pub const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Spam,
    Clean,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Spam => "spam",
            Verdict::Clean => "clean",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spam" => Ok(Verdict::Spam),
            "clean" => Ok(Verdict::Clean),
            other => Err(format!("unknown verdict '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashVersion {
    Legacy,
    V1,
}

impl HashVersion {
    pub fn as_i64(&self) -> i64 {
        match self {
            HashVersion::Legacy => 0,
            HashVersion::V1 => 1,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        if value >= 1 {
            HashVersion::V1
        } else {
            HashVersion::Legacy
        }
    }
}

/// A digest together with the scheme that produced it. Version 1 digests are
/// stored with a `v1:` prefix, legacy digests bare.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaggedHash {
    pub version: HashVersion,
    pub digest: String,
}

impl TaggedHash {
    pub fn parse(stored: &str) -> Self {
        match stored.strip_prefix(V1_PREFIX) {
            Some(digest) => TaggedHash {
                version: HashVersion::V1,
                digest: digest.to_string(),
            },
            None => TaggedHash {
                version: HashVersion::Legacy,
                digest: stored.to_string(),
            },
        }
    }
}

impl fmt::Display for TaggedHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.version {
            HashVersion::V1 => write!(f, "{V1_PREFIX}{}", self.digest),
            HashVersion::Legacy => f.write_str(&self.digest),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub subject_hash: String,
    pub body_hash: String,
    pub combined: TaggedHash,
    /// The same content under the legacy scheme, checked on a version 1 miss.
    pub legacy: TaggedHash,
}

impl Fingerprint {
    pub fn combined_hash(&self) -> String {
        self.combined.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationRecord {
    pub combined_hash: String,
    pub hash_version: HashVersion,
    pub sample_subject: String,
    pub sample_body_preview: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrence_count: i64,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupHit {
    pub verdict: Verdict,
    pub occurrence_count: i64,
    pub migrated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    pub created: bool,
    pub occurrence_count: i64,
}

pub fn normalize_subject(subject: &str) -> String {
    subject.trim().to_lowercase()
}

pub fn normalize_body(body: &str) -> String {
    let stripped = HTML_TAG.replace_all(body, " ");
    WHITESPACE.replace_all(&stripped, " ").trim().to_string()
}

fn keyed(key: &[u8], data: &[u8]) -> Result<String, FingerprintError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| FingerprintError::Key)?;
    mac.update(data);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Deterministic for the same content, secret and date.
pub fn compute_fingerprint(
    subject: &str,
    body: &str,
    secret: &[u8],
    date: NaiveDate,
) -> Result<Fingerprint, FingerprintError> {
    let subject = normalize_subject(subject);
    let body = normalize_body(body);

    let subject_hash = keyed(secret, subject.as_bytes())?;
    let body_hash = keyed(secret, body.as_bytes())?;
    let chained = keyed(subject_hash.as_bytes(), body_hash.as_bytes())?;
    let date_key = date.format("%Y-%m-%d").to_string();
    let combined = keyed(date_key.as_bytes(), chained.as_bytes())?;

    Ok(Fingerprint {
        subject_hash,
        body_hash,
        combined: TaggedHash {
            version: HashVersion::V1,
            digest: combined,
        },
        legacy: legacy_hash_normalized(&subject, &body),
    })
}

/// Unkeyed, undated digest used before version 1.
pub fn legacy_hash(subject: &str, body: &str) -> TaggedHash {
    legacy_hash_normalized(&normalize_subject(subject), &normalize_body(body))
}

fn legacy_hash_normalized(subject: &str, body: &str) -> TaggedHash {
    let mut hasher = Sha256::new();
    hasher.update(subject.as_bytes());
    hasher.update(body.as_bytes());
    TaggedHash {
        version: HashVersion::Legacy,
        digest: hex::encode(hasher.finalize()),
    }
}

fn preview(body: &str) -> String {
    normalize_body(body).chars().take(PREVIEW_CHARS).collect()
}

pub struct Classifier {
    secret: Vec<u8>,
    date: NaiveDate,
}

impl Classifier {
    pub fn new(secret: impl Into<Vec<u8>>, date: NaiveDate) -> Self {
        Self {
            secret: secret.into(),
            date,
        }
    }

    pub fn today(secret: impl Into<Vec<u8>>) -> Self {
        Self::new(secret, chrono::Local::now().date_naive())
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn fingerprint(&self, subject: &str, body: &str) -> Result<Fingerprint, FingerprintError> {
        compute_fingerprint(subject, body, &self.secret, self.date)
    }

    /// Check the version 1 hash, then the legacy hash. A legacy hit is
    /// migrated to a version 1 record carrying the same verdict. Hits bump the
    /// occurrence count.
    pub fn lookup(
        &self,
        store: &PolicyStore,
        fingerprint: &Fingerprint,
    ) -> Result<Option<LookupHit>, StoreError> {
        let now = Utc::now();
        let combined = fingerprint.combined_hash();
        if let Some((verdict, occurrence_count)) = store.touch_fingerprint(&combined, now)? {
            log::debug!("Fingerprint hit {combined}: {verdict} (seen {occurrence_count} times)");
            return Ok(Some(LookupHit {
                verdict,
                occurrence_count,
                migrated: false,
            }));
        }

        let legacy = fingerprint.legacy.to_string();
        let Some(record) = store.fingerprint(&legacy)? else {
            return Ok(None);
        };

        log::info!("Migrating legacy fingerprint {legacy} to {combined}");
        let outcome = store.upsert_fingerprint(
            &NewClassification {
                combined_hash: combined,
                hash_version: HashVersion::V1,
                subject_hash: Some(fingerprint.subject_hash.clone()),
                body_hash: Some(fingerprint.body_hash.clone()),
                sample_subject: record.sample_subject.clone(),
                sample_body_preview: record.sample_body_preview.clone(),
                verdict: record.verdict,
                initial_count: record.occurrence_count + 1,
                first_seen: record.first_seen,
            },
            now,
        )?;

        Ok(Some(LookupHit {
            verdict: record.verdict,
            occurrence_count: outcome.occurrence_count,
            migrated: true,
        }))
    }

    /// Upsert the record for this content. An existing record keeps its
    /// history: the count is bumped, timestamps refreshed and the verdict set.
    pub fn record(
        &self,
        store: &PolicyStore,
        subject: &str,
        body: &str,
        verdict: Verdict,
    ) -> Result<RecordOutcome, FingerprintError> {
        let fingerprint = self.fingerprint(subject, body)?;
        Ok(self.record_fingerprint(store, &fingerprint, subject, body, verdict)?)
    }

    pub fn record_fingerprint(
        &self,
        store: &PolicyStore,
        fingerprint: &Fingerprint,
        subject: &str,
        body: &str,
        verdict: Verdict,
    ) -> Result<RecordOutcome, StoreError> {
        let now = Utc::now();
        let outcome = store.upsert_fingerprint(
            &NewClassification {
                combined_hash: fingerprint.combined_hash(),
                hash_version: HashVersion::V1,
                subject_hash: Some(fingerprint.subject_hash.clone()),
                body_hash: Some(fingerprint.body_hash.clone()),
                sample_subject: subject.trim().to_string(),
                sample_body_preview: preview(body),
                verdict,
                initial_count: 1,
                first_seen: now,
            },
            now,
        )?;
        log::debug!(
            "Recorded {verdict} fingerprint {} (count {})",
            fingerprint.combined,
            outcome.occurrence_count
        );
        Ok(outcome)
    }

    /// Flip the verdict of known content without touching its counters.
    pub fn correct(
        &self,
        store: &PolicyStore,
        subject: &str,
        body: &str,
        verdict: Verdict,
    ) -> Result<bool, FingerprintError> {
        let fingerprint = self.fingerprint(subject, body)?;
        let mut changed = store.set_verdict(&fingerprint.combined_hash(), verdict)?;
        changed |= store.set_verdict(&fingerprint.legacy.to_string(), verdict)?;
        if !changed {
            self.record_fingerprint(store, &fingerprint, subject, body, verdict)?;
        }
        log::info!("Corrected fingerprint {} to {verdict}", fingerprint.combined);
        Ok(changed)
    }
}
