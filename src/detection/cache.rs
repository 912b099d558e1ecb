use super::rule::{CompiledRule, DetectionAlgorithm};
use super::Category;
use crate::store::StoreError;
use std::collections::HashMap;

/// Anything that can supply the enabled rules of a category.
pub trait RuleSource {
    fn source_name(&self) -> &str;

    fn enabled_rules(&self, category: Category) -> Result<Vec<DetectionAlgorithm>, StoreError>;
}

/// Inline rules from the configuration file.
impl RuleSource for Vec<DetectionAlgorithm> {
    fn source_name(&self) -> &str {
        "configuration"
    }

    fn enabled_rules(&self, category: Category) -> Result<Vec<DetectionAlgorithm>, StoreError> {
        Ok(self
            .iter()
            .filter(|r| r.enabled && r.category == category)
            .cloned()
            .collect())
    }
}

/// Compiled rule sets per category, loaded once per invocation and kept until
/// explicitly invalidated.
#[derive(Debug, Default)]
pub struct RuleCache {
    rules: HashMap<Category, Vec<CompiledRule>>,
    rejected: usize,
}

impl RuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(sources: &[&dyn RuleSource]) -> Self {
        let mut cache = Self::new();
        for category in Category::ALL {
            cache.refresh(category, sources);
        }
        cache
    }

    /// Reload one category. Rules that fail to compile are logged and left out.
    pub fn refresh(&mut self, category: Category, sources: &[&dyn RuleSource]) {
        let mut compiled = Vec::new();
        for source in sources {
            let algorithms = match source.enabled_rules(category) {
                Ok(algorithms) => algorithms,
                Err(e) => {
                    log::warn!(
                        "Failed to load {category} rules from {}: {e}",
                        source.source_name()
                    );
                    continue;
                }
            };
            for algorithm in algorithms.iter().filter(|a| a.enabled) {
                match CompiledRule::compile(algorithm) {
                    Ok(rule) => compiled.push(rule),
                    Err(e) => {
                        log::warn!("Excluding rule from {}: {e}", source.source_name());
                        self.rejected += 1;
                    }
                }
            }
        }

        // Stable sort keeps source order among equal priorities.
        compiled.sort_by(|a, b| b.priority.cmp(&a.priority));
        log::debug!("Loaded {} {category} rules", compiled.len());
        self.rules.insert(category, compiled);
    }

    pub fn invalidate(&mut self, category: Category) {
        self.rules.remove(&category);
    }

    pub fn invalidate_all(&mut self) {
        self.rules.clear();
    }

    pub fn is_loaded(&self, category: Category) -> bool {
        self.rules.contains_key(&category)
    }

    pub fn rules(&self, category: Category) -> &[CompiledRule] {
        self.rules.get(&category).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Rules excluded because they failed to compile.
    pub fn rejected(&self) -> usize {
        self.rejected
    }
}
