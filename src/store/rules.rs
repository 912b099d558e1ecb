use super::{column_error, time_column, PolicyStore, StoreError};
use crate::detection::{Category, DetectionAlgorithm, RuleSource};
use chrono::Utc;
use rusqlite::{params, Row};

const RULE_COLUMNS: &str = "id, server_id, name, category, detection_type, target, pattern, \
                            score, enabled, priority, created_at, updated_at";

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<DetectionAlgorithm> {
    let category: String = row.get(3)?;
    let detection_type: String = row.get(4)?;
    let score: i64 = row.get(7)?;
    Ok(DetectionAlgorithm {
        id: Some(row.get(0)?),
        server_id: row.get(1)?,
        name: row.get(2)?,
        category: category.parse().map_err(|e: String| column_error(3, e))?,
        detection_type: detection_type.parse().map_err(|e: String| column_error(4, e))?,
        target: row.get(5)?,
        pattern: row.get(6)?,
        score: u32::try_from(score).map_err(|_| column_error(7, format!("negative score {score}")))?,
        enabled: row.get(8)?,
        priority: row.get(9)?,
        created_at: Some(time_column(row, 10)?),
        updated_at: Some(time_column(row, 11)?),
    })
}

impl PolicyStore {
    /// Enabled rules of a category, highest priority first.
    pub fn load_rules(&self, category: Category) -> Result<Vec<DetectionAlgorithm>, StoreError> {
        let sql = format!(
            "SELECT {RULE_COLUMNS} FROM detection_algorithms
             WHERE category = ?1 AND enabled = 1
             ORDER BY priority DESC, id ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![category.as_str()], rule_from_row)?;
        let mut rules = Vec::new();
        for rule in rows {
            rules.push(rule?);
        }
        Ok(rules)
    }

    pub fn all_rules(&self) -> Result<Vec<DetectionAlgorithm>, StoreError> {
        let sql = format!(
            "SELECT {RULE_COLUMNS} FROM detection_algorithms
             ORDER BY category, priority DESC, id ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map([], rule_from_row)?;
        let mut rules = Vec::new();
        for rule in rows {
            rules.push(rule?);
        }
        Ok(rules)
    }

    /// Insert a rule, or replace the one with the same server id. Returns the
    /// row id.
    pub fn upsert_rule(&self, rule: &DetectionAlgorithm) -> Result<i64, StoreError> {
        let now = Utc::now().to_rfc3339();
        let created_at = rule.created_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| now.clone());
        let id = self.conn().query_row(
            "INSERT INTO detection_algorithms
                (server_id, name, category, detection_type, target, pattern, score,
                 enabled, priority, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(server_id) DO UPDATE SET
                name = excluded.name,
                category = excluded.category,
                detection_type = excluded.detection_type,
                target = excluded.target,
                pattern = excluded.pattern,
                score = excluded.score,
                enabled = excluded.enabled,
                priority = excluded.priority,
                updated_at = excluded.updated_at
             RETURNING id",
            params![
                rule.server_id,
                rule.name,
                rule.category.as_str(),
                rule.detection_type.as_str(),
                rule.target,
                rule.pattern,
                rule.score,
                rule.enabled,
                rule.priority,
                created_at,
                now,
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn set_rule_enabled(&self, id: i64, enabled: bool) -> Result<bool, StoreError> {
        let changed = self.conn().execute(
            "UPDATE detection_algorithms SET enabled = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, enabled, Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }
}

impl RuleSource for PolicyStore {
    fn source_name(&self) -> &str {
        "policy store"
    }

    fn enabled_rules(&self, category: Category) -> Result<Vec<DetectionAlgorithm>, StoreError> {
        self.load_rules(category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::DetectionType;

    fn rule(server_id: Option<&str>, name: &str, category: Category, priority: i32) -> DetectionAlgorithm {
        DetectionAlgorithm {
            id: None,
            server_id: server_id.map(str::to_string),
            name: name.to_string(),
            category,
            detection_type: DetectionType::Keyword,
            target: "subject,body".to_string(),
            pattern: name.to_string(),
            score: 25,
            enabled: true,
            priority,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_load_rules_filters_and_orders() {
        let store = PolicyStore::open_in_memory().unwrap();
        store.upsert_rule(&rule(None, "low", Category::Spam, 1)).unwrap();
        store.upsert_rule(&rule(None, "high", Category::Spam, 9)).unwrap();
        store.upsert_rule(&rule(None, "phish", Category::Phishing, 5)).unwrap();
        let disabled = store.upsert_rule(&rule(None, "off", Category::Spam, 20)).unwrap();
        assert!(store.set_rule_enabled(disabled, false).unwrap());

        let names: Vec<String> = store
            .load_rules(Category::Spam)
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["high", "low"]);
        assert_eq!(store.all_rules().unwrap().len(), 4);
    }

    #[test]
    fn test_upsert_by_server_id_replaces() {
        let store = PolicyStore::open_in_memory().unwrap();
        let first = store.upsert_rule(&rule(Some("srv-1"), "old", Category::Spam, 0)).unwrap();
        let mut updated = rule(Some("srv-1"), "new", Category::Spam, 0);
        updated.score = 60;
        let second = store.upsert_rule(&updated).unwrap();
        assert_eq!(first, second);

        let rules = store.load_rules(Category::Spam).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "new");
        assert_eq!(rules[0].score, 60);
        assert_eq!(rules[0].server_id.as_deref(), Some("srv-1"));
    }

    #[test]
    fn test_store_is_a_rule_source() {
        let store = PolicyStore::open_in_memory().unwrap();
        store.upsert_rule(&rule(None, "casino", Category::Spam, 0)).unwrap();
        let cache = crate::detection::RuleCache::load(&[&store as &dyn RuleSource]);
        assert_eq!(cache.rules(Category::Spam).len(), 1);
    }
}
