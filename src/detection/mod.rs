//! Threat Detection Engine
//!
//! One generic evaluator runs every category: each category contributes a
//! descriptor (name and threshold) and its cached, pre-compiled rules. The
//! result is a plain weighted sum compared against the threshold.

pub mod cache;
pub mod rule;

pub use cache::{RuleCache, RuleSource};
pub use rule::{CompiledRule, DetectionAlgorithm, DetectionType, MessageContent, RuleCompilationError};

use crate::message::HeaderMap;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_SPAM_THRESHOLD: u32 = 50;
pub const PHISHING_THRESHOLD: u32 = 70;
pub const VIRUS_THRESHOLD: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Spam,
    Phishing,
    Virus,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Spam, Category::Phishing, Category::Virus];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Spam => "spam",
            Category::Phishing => "phishing",
            Category::Virus => "virus",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "spam" => Ok(Category::Spam),
            "phishing" => Ok(Category::Phishing),
            "virus" => Ok(Category::Virus),
            other => Err(format!("unknown category '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryDescriptor {
    pub category: Category,
    pub threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleMatch {
    pub algorithm_name: String,
    pub score: u32,
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreatAnalysisResult {
    pub category: Category,
    pub matches: Vec<RuleMatch>,
    pub total_score: u32,
    pub threshold: u32,
    pub is_threat: bool,
}

impl ThreatAnalysisResult {
    /// `name=score` pairs of the matched rules, for reports and logs.
    pub fn summary(&self) -> String {
        self.matches
            .iter()
            .map(|m| format!("{}={}", m.algorithm_name, m.score))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Sum the scores of every matching rule and compare against the threshold
/// (inclusive).
pub fn evaluate(
    descriptor: &CategoryDescriptor,
    rules: &[CompiledRule],
    content: &MessageContent<'_>,
) -> ThreatAnalysisResult {
    let mut matches = Vec::new();
    let mut total_score: u32 = 0;

    for rule in rules {
        if rule.matches(content) {
            log::debug!(
                "[{}] rule '{}' matched (+{})",
                descriptor.category,
                rule.name,
                rule.score
            );
            total_score = total_score.saturating_add(rule.score);
            matches.push(RuleMatch {
                algorithm_name: rule.name.clone(),
                score: rule.score,
                pattern: rule.pattern.clone(),
            });
        }
    }

    ThreatAnalysisResult {
        category: descriptor.category,
        matches,
        total_score,
        threshold: descriptor.threshold,
        is_threat: total_score >= descriptor.threshold,
    }
}

pub struct DetectionEngine {
    descriptors: Vec<CategoryDescriptor>,
    cache: RuleCache,
}

impl DetectionEngine {
    pub fn new(descriptors: Vec<CategoryDescriptor>, cache: RuleCache) -> Self {
        Self { descriptors, cache }
    }

    pub fn descriptor(&self, category: Category) -> Option<&CategoryDescriptor> {
        self.descriptors.iter().find(|d| d.category == category)
    }

    pub fn cache(&self) -> &RuleCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut RuleCache {
        &mut self.cache
    }

    pub fn analyze(&self, category: Category, headers: &HeaderMap, body: &str) -> ThreatAnalysisResult {
        let content = MessageContent::new(headers, Cow::Borrowed(body));
        self.analyze_content(category, &content)
    }

    /// Run every configured category against one message.
    pub fn analyze_all(&self, content: &MessageContent<'_>) -> Vec<ThreatAnalysisResult> {
        self.descriptors
            .iter()
            .map(|d| self.analyze_content(d.category, content))
            .collect()
    }

    fn analyze_content(&self, category: Category, content: &MessageContent<'_>) -> ThreatAnalysisResult {
        let descriptor = self.descriptor(category).copied().unwrap_or(CategoryDescriptor {
            category,
            threshold: default_threshold(category),
        });
        let result = evaluate(&descriptor, self.cache.rules(category), content);
        log::info!(
            "[{}] score {}/{} ({} rules matched){}",
            category,
            result.total_score,
            result.threshold,
            result.matches.len(),
            if result.is_threat { " - threat" } else { "" }
        );
        result
    }
}

pub fn default_threshold(category: Category) -> u32 {
    match category {
        Category::Spam => DEFAULT_SPAM_THRESHOLD,
        Category::Phishing => PHISHING_THRESHOLD,
        Category::Virus => VIRUS_THRESHOLD,
    }
}
