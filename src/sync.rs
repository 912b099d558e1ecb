//! Client for the upstream policy service: pulls rule sets per category and
//! reports newly seen spam fingerprints. Every failure here is logged and
//! ignored; local rules stay authoritative.

use crate::config::{system_hostname, SyncConfig};
use crate::detection::{Category, CompiledRule, DetectionAlgorithm};
use crate::pipeline::SpamReport;
use crate::store::{PolicyStore, StoreError};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Long enough that a stored rule-set version outlives any refresh interval.
const VERSION_TTL: Duration = Duration::from_secs(365 * 24 * 3600);

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("sync request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("sync is enabled but no endpoint is configured")]
    NoEndpoint,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleSetResponse {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub rules: Vec<DetectionAlgorithm>,
}

#[derive(Debug, Serialize)]
struct FingerprintReport<'a> {
    client_id: &'a str,
    fingerprint: &'a str,
    category: Category,
    #[serde(skip_serializing_if = "Option::is_none")]
    originating_address: Option<&'a str>,
    reported_at: DateTime<Utc>,
}

fn rules_key(category: Category) -> String {
    format!("sync:rules:{category}")
}

fn version_key(category: Category) -> String {
    format!("sync:version:{category}")
}

fn fingerprint_key(fingerprint: &str) -> String {
    format!("report:fp:{fingerprint}")
}

fn address_key(address: &str) -> String {
    format!("report:ip:{address}")
}

pub struct SyncClient {
    client: Client,
    endpoint: String,
    client_id: String,
    interval: Duration,
    report_ttl: Duration,
}

impl SyncClient {
    pub fn new(config: &SyncConfig) -> Result<Self, SyncError> {
        let endpoint = config
            .endpoint
            .as_deref()
            .map(|e| e.trim_end_matches('/').to_string())
            .filter(|e| !e.is_empty())
            .ok_or(SyncError::NoEndpoint)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(concat!("mailguard/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            client_id: config.client_id.clone().unwrap_or_else(system_hostname),
            interval: Duration::from_secs(config.interval_seconds),
            report_ttl: Duration::from_secs(config.report_ttl_seconds),
        })
    }

    /// Refresh every category whose refresh window has lapsed. Returns the
    /// categories that were updated.
    pub async fn refresh_rules(&self, store: &PolicyStore) -> Vec<Category> {
        let mut refreshed = Vec::new();
        for category in Category::ALL {
            match self.refresh_category(store, category).await {
                Ok(Some(count)) => {
                    log::info!("Synced {count} {category} rules from {}", self.endpoint);
                    refreshed.push(category);
                }
                Ok(None) => log::debug!("{category} rules are fresh, skipping sync"),
                Err(e) => log::warn!("Rule sync for {category} failed, using local rules: {e}"),
            }
        }
        refreshed
    }

    async fn refresh_category(&self, store: &PolicyStore, category: Category) -> Result<Option<usize>, SyncError> {
        let now = Utc::now();
        if !rules_due(store, category, now)? {
            return Ok(None);
        }
        let version = store.cache_get(&version_key(category), now)?.unwrap_or_default();

        let response: RuleSetResponse = self
            .client
            .get(format!("{}/rules", self.endpoint))
            .query(&[
                ("category", category.as_str()),
                ("client_id", self.client_id.as_str()),
                ("version", version.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let count = apply_rule_set(store, category, &response)?;
        mark_refreshed(store, category, &response.version, self.interval, now)?;
        Ok(Some(count))
    }

    /// Report a newly seen spam fingerprint once. Returns whether a report was
    /// sent.
    pub async fn report_fingerprint(&self, store: &PolicyStore, report: &SpamReport) -> bool {
        let now = Utc::now();
        match report_suppressed(store, report, now) {
            Ok(true) => {
                log::debug!("Fingerprint {} already reported", report.fingerprint);
                return false;
            }
            Ok(false) => {}
            Err(e) => {
                log::warn!("Cannot check report cache, skipping report: {e}");
                return false;
            }
        }

        let body = FingerprintReport {
            client_id: &self.client_id,
            fingerprint: &report.fingerprint,
            category: report.category,
            originating_address: report.originating_address.as_deref(),
            reported_at: now,
        };
        let sent = self
            .client
            .post(format!("{}/fingerprints", self.endpoint))
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        if let Err(e) = sent {
            log::warn!("Fingerprint report failed: {e}");
            return false;
        }

        if let Err(e) = mark_reported(store, report, self.report_ttl, now) {
            log::warn!("Failed to cache fingerprint report: {e}");
        }
        log::info!("Reported fingerprint {}", report.fingerprint);
        true
    }
}

fn rules_due(store: &PolicyStore, category: Category, now: DateTime<Utc>) -> Result<bool, StoreError> {
    Ok(store.cache_get(&rules_key(category), now)?.is_none())
}

fn mark_refreshed(
    store: &PolicyStore,
    category: Category,
    version: &str,
    interval: Duration,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    store.cache_put(&rules_key(category), version, interval, now)?;
    store.cache_put(&version_key(category), version, VERSION_TTL, now)
}

/// Upsert the received rules. Rules without a server id or with a pattern
/// that does not compile are skipped.
fn apply_rule_set(store: &PolicyStore, category: Category, response: &RuleSetResponse) -> Result<usize, StoreError> {
    let mut applied = 0;
    for rule in &response.rules {
        if rule.server_id.is_none() {
            log::warn!("Ignoring synced rule '{}' without server id", rule.name);
            continue;
        }
        if rule.category != category {
            log::warn!(
                "Ignoring synced rule '{}': category {} in a {category} rule set",
                rule.name,
                rule.category
            );
            continue;
        }
        if let Err(e) = CompiledRule::compile(rule) {
            log::warn!("Ignoring synced rule: {e}");
            continue;
        }
        store.upsert_rule(rule)?;
        applied += 1;
    }
    Ok(applied)
}

fn report_suppressed(store: &PolicyStore, report: &SpamReport, now: DateTime<Utc>) -> Result<bool, StoreError> {
    if store.cache_get(&fingerprint_key(&report.fingerprint), now)?.is_some() {
        return Ok(true);
    }
    match &report.originating_address {
        Some(address) => Ok(store.cache_get(&address_key(address), now)?.is_some()),
        None => Ok(false),
    }
}

fn mark_reported(store: &PolicyStore, report: &SpamReport, ttl: Duration, now: DateTime<Utc>) -> Result<(), StoreError> {
    store.cache_put(&fingerprint_key(&report.fingerprint), "1", ttl, now)?;
    if let Some(address) = &report.originating_address {
        store.cache_put(&address_key(address), &report.fingerprint, ttl, now)?;
    }
    Ok(())
}
