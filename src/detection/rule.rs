use super::Category;
use crate::domain_utils::DomainUtils;
use crate::message::HeaderMap;
use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

/// Characters accepted as regex delimiters, e.g. `/spam/` or `#spam#i`.
const REGEX_DELIMITERS: &[char] = &['/', '#', '~', '!', '@', '%', '|', '+'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionType {
    Keyword,
    Regex,
    Domain,
    HeaderCheck,
    UrlScan,
}

impl DetectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionType::Keyword => "keyword",
            DetectionType::Regex => "regex",
            DetectionType::Domain => "domain",
            DetectionType::HeaderCheck => "header_check",
            DetectionType::UrlScan => "url_scan",
        }
    }
}

impl FromStr for DetectionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "keyword" => Ok(DetectionType::Keyword),
            "regex" => Ok(DetectionType::Regex),
            "domain" => Ok(DetectionType::Domain),
            "header_check" => Ok(DetectionType::HeaderCheck),
            "url_scan" => Ok(DetectionType::UrlScan),
            other => Err(format!("unknown detection type '{other}'")),
        }
    }
}

impl fmt::Display for DetectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_target() -> String {
    "subject,body".to_string()
}

fn default_enabled() -> bool {
    true
}

/// A declarative detection rule as stored in the policy database, written in
/// configuration, or received from the sync service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionAlgorithm {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    pub name: String,
    pub category: Category,
    pub detection_type: DetectionType,
    #[serde(default = "default_target")]
    pub target: String,
    pub pattern: String,
    pub score: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RuleCompilationError {
    #[error("rule '{rule}': pattern is empty")]
    EmptyPattern { rule: String },
    #[error("rule '{rule}': invalid regex '{pattern}': {source}")]
    InvalidRegex {
        rule: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("rule '{rule}': unknown target selector '{selector}'")]
    UnknownTarget { rule: String, selector: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetField {
    Subject,
    Body,
    From,
    Headers,
}

/// Pattern resolved once at load time.
#[derive(Debug, Clone)]
pub enum Matcher {
    Keyword(String),
    Regex(Regex),
    Domain(String),
    Header(String),
    Url(String),
}

/// Message fields rules can select, extracted once per message.
pub struct MessageContent<'a> {
    subject: &'a str,
    from: &'a str,
    body: Cow<'a, str>,
    headers: String,
}

impl<'a> MessageContent<'a> {
    pub fn new(headers: &'a HeaderMap, body: Cow<'a, str>) -> Self {
        Self {
            subject: headers.get("Subject").unwrap_or(""),
            from: headers.get("From").unwrap_or(""),
            body,
            headers: headers.serialize(),
        }
    }

    /// Selected fields joined with single spaces.
    pub fn target_text(&self, targets: &[TargetField]) -> String {
        targets
            .iter()
            .map(|t| match t {
                TargetField::Subject => self.subject,
                TargetField::Body => self.body.as_ref(),
                TargetField::From => self.from,
                TargetField::Headers => self.headers.as_str(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn serialized_headers(&self) -> &str {
        &self.headers
    }
}

#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: String,
    pub category: Category,
    pub pattern: String,
    pub score: u32,
    pub priority: i32,
    pub targets: Vec<TargetField>,
    pub matcher: Matcher,
}

impl CompiledRule {
    pub fn compile(algorithm: &DetectionAlgorithm) -> Result<Self, RuleCompilationError> {
        let rule = &algorithm.name;
        let pattern = algorithm.pattern.trim();
        if pattern.is_empty() {
            return Err(RuleCompilationError::EmptyPattern { rule: rule.clone() });
        }

        let targets = parse_targets(rule, &algorithm.target)?;
        let matcher = match algorithm.detection_type {
            DetectionType::Keyword => Matcher::Keyword(pattern.to_lowercase()),
            DetectionType::Regex => Matcher::Regex(compile_regex(rule, pattern)?),
            DetectionType::Domain => Matcher::Domain(pattern.to_lowercase()),
            DetectionType::HeaderCheck => Matcher::Header(pattern.to_lowercase()),
            DetectionType::UrlScan => Matcher::Url(pattern.to_lowercase()),
        };

        Ok(Self {
            name: algorithm.name.clone(),
            category: algorithm.category,
            pattern: algorithm.pattern.clone(),
            score: algorithm.score,
            priority: algorithm.priority,
            targets,
            matcher,
        })
    }

    pub fn matches(&self, content: &MessageContent<'_>) -> bool {
        match &self.matcher {
            Matcher::Keyword(keyword) => content
                .target_text(&self.targets)
                .to_lowercase()
                .contains(keyword.as_str()),
            Matcher::Regex(regex) => regex.is_match(&content.target_text(&self.targets)),
            Matcher::Domain(needle) | Matcher::Url(needle) => {
                DomainUtils::extract_url_hosts(&content.target_text(&self.targets))
                    .iter()
                    .any(|host| host.contains(needle.as_str()))
            }
            Matcher::Header(needle) => content
                .serialized_headers()
                .to_lowercase()
                .contains(needle.as_str()),
        }
    }
}

fn parse_targets(rule: &str, target: &str) -> Result<Vec<TargetField>, RuleCompilationError> {
    let mut fields = Vec::new();
    for selector in target.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let field = match selector.to_lowercase().as_str() {
            "subject" => TargetField::Subject,
            "body" => TargetField::Body,
            "from" => TargetField::From,
            "headers" => TargetField::Headers,
            _ => {
                return Err(RuleCompilationError::UnknownTarget {
                    rule: rule.to_string(),
                    selector: selector.to_string(),
                })
            }
        };
        if !fields.contains(&field) {
            fields.push(field);
        }
    }
    if fields.is_empty() {
        fields = vec![TargetField::Subject, TargetField::Body];
    }
    Ok(fields)
}

/// Split a delimited pattern such as `/abc/` or `#abc#i` into body and flags.
fn split_delimited(pattern: &str) -> Option<(&str, &str)> {
    let first = pattern.chars().next()?;
    if !REGEX_DELIMITERS.contains(&first) || pattern.len() < 2 {
        return None;
    }
    let close = pattern.rfind(first)?;
    if close == 0 {
        return None;
    }
    let flags = &pattern[close + first.len_utf8()..];
    if !flags.chars().all(|c| matches!(c, 'i' | 'm' | 's' | 'x' | 'u')) {
        return None;
    }
    Some((&pattern[first.len_utf8()..close], flags))
}

/// Delimited patterns are used as written; anything else is matched
/// case-insensitively.
fn compile_regex(rule: &str, pattern: &str) -> Result<Regex, RuleCompilationError> {
    let mut builder = match split_delimited(pattern) {
        Some((body, flags)) => {
            let mut builder = RegexBuilder::new(body);
            builder
                .case_insensitive(flags.contains('i'))
                .multi_line(flags.contains('m'))
                .dot_matches_new_line(flags.contains('s'))
                .ignore_whitespace(flags.contains('x'));
            builder
        }
        None => {
            let mut builder = RegexBuilder::new(pattern);
            builder.case_insensitive(true);
            builder
        }
    };

    builder
        .size_limit(1 << 20)
        .build()
        .map_err(|source| RuleCompilationError::InvalidRegex {
            rule: rule.to_string(),
            pattern: pattern.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str, kind: DetectionType, target: &str, pattern: &str, score: u32) -> DetectionAlgorithm {
        DetectionAlgorithm {
            id: None,
            server_id: None,
            name: name.to_string(),
            category: Category::Spam,
            detection_type: kind,
            target: target.to_string(),
            pattern: pattern.to_string(),
            score,
            enabled: true,
            priority: 0,
            created_at: None,
            updated_at: None,
        }
    }

    fn content_of<'a>(headers: &'a HeaderMap, body: &'static str) -> MessageContent<'a> {
        MessageContent::new(headers, Cow::Borrowed(body))
    }

    fn sample_headers() -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("From", "Promo <deals@cheap-pills.test>");
        h.insert("Subject", "Limited OFFER inside");
        h.insert("X-Mailer", "BulkBlaster 3");
        h
    }

    #[test]
    fn test_keyword_is_case_insensitive() {
        let h = sample_headers();
        let content = content_of(&h, "nothing");
        let compiled = CompiledRule::compile(&rule("offer", DetectionType::Keyword, "subject", "offer", 10)).unwrap();
        assert!(compiled.matches(&content));

        let body_only = CompiledRule::compile(&rule("offer", DetectionType::Keyword, "body", "offer", 10)).unwrap();
        assert!(!body_only.matches(&content));
    }

    #[test]
    fn test_regex_delimiters() {
        let h = sample_headers();
        let content = content_of(&h, "");

        // Undelimited patterns are wrapped case-insensitively.
        let wrapped = CompiledRule::compile(&rule("r", DetectionType::Regex, "subject", r"limited\s+offer", 1)).unwrap();
        assert!(wrapped.matches(&content));

        // Delimited without flags is case-sensitive.
        let strict = CompiledRule::compile(&rule("r", DetectionType::Regex, "subject", "/limited offer/", 1)).unwrap();
        assert!(!strict.matches(&content));

        let flagged = CompiledRule::compile(&rule("r", DetectionType::Regex, "subject", "#limited offer#i", 1)).unwrap();
        assert!(flagged.matches(&content));
    }

    #[test]
    fn test_invalid_regex_rejected_at_compile() {
        let err = CompiledRule::compile(&rule("broken", DetectionType::Regex, "body", "(unclosed", 5)).unwrap_err();
        assert!(matches!(err, RuleCompilationError::InvalidRegex { .. }));
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_unknown_target_rejected() {
        let err = CompiledRule::compile(&rule("t", DetectionType::Keyword, "subject,attachments", "x", 5)).unwrap_err();
        assert!(matches!(err, RuleCompilationError::UnknownTarget { .. }));
    }

    #[test]
    fn test_domain_and_url_scan_match_hosts() {
        let h = sample_headers();
        let content = content_of(&h, "Visit https://secure-login.paypa1.test/account now");
        let domain = CompiledRule::compile(&rule("d", DetectionType::Domain, "body", "paypa1", 30)).unwrap();
        assert!(domain.matches(&content));

        // The path is not part of the host.
        let url = CompiledRule::compile(&rule("u", DetectionType::UrlScan, "body", "account", 30)).unwrap();
        assert!(!url.matches(&content));
    }

    #[test]
    fn test_header_check_uses_serialized_headers() {
        let h = sample_headers();
        let content = content_of(&h, "");
        let compiled = CompiledRule::compile(&rule("h", DetectionType::HeaderCheck, "body", "x-mailer: bulkblaster", 20)).unwrap();
        assert!(compiled.matches(&content));
    }

    #[test]
    fn test_target_concatenation() {
        let h = sample_headers();
        let content = content_of(&h, "body text");
        assert_eq!(
            content.target_text(&[TargetField::Subject, TargetField::Body]),
            "Limited OFFER inside body text"
        );
    }
}
