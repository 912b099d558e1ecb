use crate::fingerprint::Verdict;
use crate::store::{PolicyStore, StoreError};
use rusqlite::params;
use serde::Serialize;

const RULE_PREFIX: &str = "rule:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatEvent {
    EmailProcessed,
    Allowed,
    Tagged,
    Quarantined,
    Rejected,
    FingerprintHit,
    SystemError,
    RuleMatch { rule_name: String },
}

impl StatEvent {
    fn counter(&self) -> String {
        match self {
            StatEvent::EmailProcessed => "processed".to_string(),
            StatEvent::Allowed => "allowed".to_string(),
            StatEvent::Tagged => "tagged".to_string(),
            StatEvent::Quarantined => "quarantined".to_string(),
            StatEvent::Rejected => "rejected".to_string(),
            StatEvent::FingerprintHit => "fingerprint_hits".to_string(),
            StatEvent::SystemError => "system_errors".to_string(),
            StatEvent::RuleMatch { rule_name } => format!("{RULE_PREFIX}{rule_name}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GlobalStats {
    pub total_emails: i64,
    pub allowed: i64,
    pub tagged: i64,
    pub quarantined: i64,
    pub rejected: i64,
    pub fingerprint_hits: i64,
    pub system_errors: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleStats {
    pub rule_name: String,
    pub matches: i64,
}

/// Records processing events as shared counters. Without a store the events
/// are only logged.
pub struct StatisticsCollector<'a> {
    store: Option<&'a PolicyStore>,
}

impl<'a> StatisticsCollector<'a> {
    pub fn new(store: Option<&'a PolicyStore>) -> Self {
        Self { store }
    }

    pub fn record_event(&self, event: StatEvent) {
        let Some(store) = self.store else {
            log::trace!("Statistics disabled, dropping {event:?}");
            return;
        };
        if let Err(e) = increment(store, &event.counter()) {
            log::warn!("Failed to record statistics event {event:?}: {e}");
        }
    }
}

fn increment(store: &PolicyStore, name: &str) -> Result<(), StoreError> {
    // Single statement so concurrent filters never lose an increment.
    store.conn().execute(
        "INSERT INTO stats (name, value) VALUES (?1, 1)
         ON CONFLICT(name) DO UPDATE SET value = value + 1",
        params![name],
    )?;
    Ok(())
}

pub fn get_stats(store: &PolicyStore) -> Result<(GlobalStats, Vec<RuleStats>), StoreError> {
    let mut stmt = store.conn().prepare("SELECT name, value FROM stats")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

    let mut global = GlobalStats::default();
    let mut rules = Vec::new();
    for row in rows {
        let (name, value) = row?;
        match name.as_str() {
            "processed" => global.total_emails = value,
            "allowed" => global.allowed = value,
            "tagged" => global.tagged = value,
            "quarantined" => global.quarantined = value,
            "rejected" => global.rejected = value,
            "fingerprint_hits" => global.fingerprint_hits = value,
            "system_errors" => global.system_errors = value,
            other => {
                if let Some(rule_name) = other.strip_prefix(RULE_PREFIX) {
                    rules.push(RuleStats {
                        rule_name: rule_name.to_string(),
                        matches: value,
                    });
                }
            }
        }
    }

    rules.sort_by(|a, b| b.matches.cmp(&a.matches).then_with(|| a.rule_name.cmp(&b.rule_name)));
    Ok((global, rules))
}

pub fn reset_stats(store: &PolicyStore) -> Result<(), StoreError> {
    store.conn().execute("DELETE FROM stats", [])?;
    Ok(())
}

/// Human readable report for `--stats`.
pub fn format_report(global: &GlobalStats, rules: &[RuleStats], fingerprints: &[(Verdict, i64)]) -> String {
    let mut out = String::new();
    out.push_str("Mail filter statistics\n");
    out.push_str("======================\n");
    out.push_str(&format!("Processed:        {}\n", global.total_emails));
    out.push_str(&format!("Allowed:          {}\n", global.allowed));
    out.push_str(&format!("Tagged:           {}\n", global.tagged));
    out.push_str(&format!("Quarantined:      {}\n", global.quarantined));
    out.push_str(&format!("Rejected:         {}\n", global.rejected));
    out.push_str(&format!("Fingerprint hits: {}\n", global.fingerprint_hits));
    out.push_str(&format!("System errors:    {}\n", global.system_errors));

    if !fingerprints.is_empty() {
        out.push_str("\nKnown fingerprints:\n");
        for (verdict, count) in fingerprints {
            out.push_str(&format!("  {:<6} {count}\n", verdict.as_str()));
        }
    }

    if !rules.is_empty() {
        out.push_str("\nRule matches:\n");
        for rule in rules {
            out.push_str(&format!("  {:>6}  {}\n", rule.matches, rule.rule_name));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_accumulate() {
        let store = PolicyStore::open_in_memory().unwrap();
        let stats = StatisticsCollector::new(Some(&store));
        stats.record_event(StatEvent::EmailProcessed);
        stats.record_event(StatEvent::EmailProcessed);
        stats.record_event(StatEvent::Quarantined);
        stats.record_event(StatEvent::RuleMatch {
            rule_name: "casino".to_string(),
        });

        let (global, rules) = get_stats(&store).unwrap();
        assert_eq!(global.total_emails, 2);
        assert_eq!(global.quarantined, 1);
        assert_eq!(global.allowed, 0);
        assert_eq!(
            rules,
            vec![RuleStats {
                rule_name: "casino".to_string(),
                matches: 1
            }]
        );

        reset_stats(&store).unwrap();
        assert_eq!(get_stats(&store).unwrap().0, GlobalStats::default());
    }

    #[test]
    fn test_without_store_is_silent() {
        StatisticsCollector::new(None).record_event(StatEvent::SystemError);
    }

    #[test]
    fn test_report_lists_counters() {
        let global = GlobalStats {
            total_emails: 3,
            ..Default::default()
        };
        let report = format_report(&global, &[], &[]);
        assert!(report.contains("Processed:        3"));
        assert!(!report.contains("Rule matches"));
    }
}
