//! Disposition Router
//!
//! Turns the classification of a message into one of four actions and applies
//! the matching message transforms. Side effects (quarantine writes, bounces,
//! delivery) are left to the pipeline.

use crate::config::Config;
use crate::detection::{Category, ThreatAnalysisResult};
use crate::message::{OutgoingMessage, ParsedMessage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Diagnostic header added to quarantined copies.
pub const QUARANTINE_HEADER: &str = "X-Mailguard-Quarantine";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Headers,
    Quarantine,
    Reject,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::Headers => "headers",
            Action::Quarantine => "quarantine",
            Action::Reject => "reject",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "allow" => Ok(Action::Allow),
            "headers" => Ok(Action::Headers),
            "quarantine" => Ok(Action::Quarantine),
            "reject" => Ok(Action::Reject),
            other => Err(format!("unknown action '{other}'")),
        }
    }
}

/// The threat a message was judged to be, from rules or a known fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreatVerdict {
    pub category: Category,
    pub score: u32,
    pub threshold: u32,
    /// Matched rules, or the fingerprint that decided it.
    pub report: String,
}

impl ThreatVerdict {
    /// The highest scoring category over its threshold, if any.
    pub fn from_results(results: &[ThreatAnalysisResult]) -> Option<Self> {
        results
            .iter()
            .filter(|r| r.is_threat)
            .max_by_key(|r| r.total_score)
            .map(|r| ThreatVerdict {
                category: r.category,
                score: r.total_score,
                threshold: r.threshold,
                report: r.summary(),
            })
    }

    /// A fingerprint previously recorded as spam.
    pub fn known_spam(threshold: u32, fingerprint: &str) -> Self {
        ThreatVerdict {
            category: Category::Spam,
            score: threshold,
            threshold,
            report: format!("fingerprint match {fingerprint}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingDecision {
    pub action: Action,
    pub reason: String,
    pub category: Option<Category>,
    /// The message after transforms. For `reject` this is the original,
    /// which the bounce quotes.
    pub message: OutgoingMessage,
}

/// `min(10, score)` asterisks.
pub fn level_stars(score: u32) -> String {
    "*".repeat(score.min(10) as usize)
}

pub struct DispositionRouter<'a> {
    config: &'a Config,
}

impl<'a> DispositionRouter<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    pub fn decide(&self, message: &ParsedMessage, verdict: Option<&ThreatVerdict>) -> ProcessingDecision {
        let Some(verdict) = verdict else {
            return ProcessingDecision {
                action: Action::Allow,
                reason: "clean".to_string(),
                category: None,
                message: self.allow(message),
            };
        };

        let action = self.config.action_for(verdict.category);
        let reason = format!(
            "{} score {}/{}: {}",
            verdict.category, verdict.score, verdict.threshold, verdict.report
        );
        log::info!("Disposition {action} ({reason})");

        let transformed = match action {
            Action::Allow => self.allow(message),
            Action::Headers => self.tag(message, verdict),
            Action::Quarantine => {
                let mut outgoing = message.to_outgoing();
                outgoing.add_header(QUARANTINE_HEADER, &diagnostic(verdict));
                outgoing
            }
            Action::Reject => message.to_outgoing(),
        };

        ProcessingDecision {
            action,
            reason,
            category: Some(verdict.category),
            message: transformed,
        }
    }

    fn allow(&self, message: &ParsedMessage) -> OutgoingMessage {
        let mut outgoing = message.to_outgoing();
        if let Some(footer) = self.config.spam.footer.as_deref().filter(|f| !f.is_empty()) {
            outgoing.append_footer(footer);
        }
        outgoing
    }

    fn tag(&self, message: &ParsedMessage, verdict: &ThreatVerdict) -> OutgoingMessage {
        let mut outgoing = message.to_outgoing();
        outgoing.add_header("X-Spam-Flag", "YES");
        outgoing.add_header("X-Spam-Score", &verdict.score.to_string());
        outgoing.add_header("X-Spam-Level", &level_stars(verdict.score));
        outgoing.add_header(
            "X-Spam-Status",
            &format!("Yes, score={} required={}", verdict.score, verdict.threshold),
        );
        outgoing.add_header(
            "X-Spam-Report",
            &format!("{}: {}", verdict.category, verdict.report),
        );
        outgoing.tag_subject(&self.config.spam.subject_tag);
        outgoing
    }
}

fn diagnostic(verdict: &ThreatVerdict) -> String {
    format!(
        "category={} score={} threshold={} ({})",
        verdict.category, verdict.score, verdict.threshold, verdict.report
    )
}
