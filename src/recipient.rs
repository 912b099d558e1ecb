use crate::domain_utils::DomainUtils;
use crate::message::HeaderMap;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;

lazy_static! {
    static ref ANGLE_ADDRESS: Regex = Regex::new(r"<([^<>\s]+)>").unwrap();
    static ref VALID_ADDRESS: Regex = Regex::new(
        r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)+$"
    )
    .unwrap();
    static ref ADDRESS_LIKE: Regex =
        Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap();
}

/// Headers that name the sender side and are never scanned for the recipient.
const SENDER_HEADERS: &[&str] = &["From", "Sender", "Reply-To", "Return-Path", "Errors-To"];

/// Recipient headers consulted first, in order.
const RECIPIENT_HEADERS: &[&str] = &["To", "Delivered-To", "X-Original-To"];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RecipientError {
    #[error("no valid recipient address found in headers, environment or arguments")]
    NotFound,
}

/// What the MTA handed to this invocation besides the message itself.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    /// Values of the configured recipient environment variables.
    pub env: HashMap<String, String>,
    pub recipient_arg: Option<String>,
    pub sender_arg: Option<String>,
    /// Remaining positional arguments.
    pub args: Vec<String>,
    /// Address of the connecting client when the MTA exports it.
    pub client_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipientSource {
    Header(String),
    Environment(String),
    RecipientArgument,
    Argument,
    HeaderScan(String),
}

impl fmt::Display for RecipientSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecipientSource::Header(name) => write!(f, "header {name}"),
            RecipientSource::Environment(var) => write!(f, "environment {var}"),
            RecipientSource::RecipientArgument => write!(f, "--recipient"),
            RecipientSource::Argument => write!(f, "argument"),
            RecipientSource::HeaderScan(name) => write!(f, "scan of header {name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRecipient {
    pub address: String,
    pub source: RecipientSource,
}

pub struct RecipientResolver {
    env_vars: Vec<String>,
    mail_domain: Option<String>,
}

impl RecipientResolver {
    pub fn new(env_vars: Vec<String>, mail_domain: Option<String>) -> Self {
        Self {
            env_vars,
            mail_domain: mail_domain.map(|d| d.to_lowercase()),
        }
    }

    pub fn resolve(
        &self,
        headers: &HeaderMap,
        invocation: &Invocation,
    ) -> Result<ResolvedRecipient, RecipientError> {
        let found = |address: String, source: RecipientSource| {
            log::debug!("Recipient {address} resolved from {source}");
            Ok(ResolvedRecipient { address, source })
        };

        for name in RECIPIENT_HEADERS {
            if let Some(address) = headers.get(name).and_then(normalize_address) {
                return found(address, RecipientSource::Header(name.to_string()));
            }
        }

        for var in &self.env_vars {
            if let Some(address) = invocation.env.get(var).and_then(|v| normalize_address(v)) {
                return found(address, RecipientSource::Environment(var.clone()));
            }
        }

        if let Some(address) = invocation.recipient_arg.as_deref().and_then(normalize_address) {
            return found(address, RecipientSource::RecipientArgument);
        }

        for arg in invocation.args.iter().filter(|a| a.contains('@')) {
            if let Some(address) = normalize_address(arg) {
                return found(address, RecipientSource::Argument);
            }
        }

        if let Some(domain) = &self.mail_domain {
            for (name, value) in headers.iter() {
                let excluded = SENDER_HEADERS
                    .iter()
                    .chain(RECIPIENT_HEADERS)
                    .any(|h| h.eq_ignore_ascii_case(name));
                if excluded {
                    continue;
                }
                let on_domain = ADDRESS_LIKE.find_iter(value).map(|m| m.as_str()).find(|a| {
                    DomainUtils::extract_domain(a).is_some_and(|d| d == *domain)
                });
                if let Some(address) = on_domain {
                    return found(address.to_string(), RecipientSource::HeaderScan(name.to_string()));
                }
            }
        }

        log::warn!("Unable to resolve recipient from any source");
        Err(RecipientError::NotFound)
    }
}

/// Bounce target: `--sender`, then `Return-Path`, `Sender`, `From`.
pub fn resolve_sender(headers: &HeaderMap, invocation: &Invocation) -> Option<String> {
    if let Some(address) = invocation.sender_arg.as_deref().and_then(normalize_address) {
        return Some(address);
    }
    ["Return-Path", "Sender", "From"]
        .iter()
        .find_map(|name| headers.get(name).and_then(normalize_address))
}

/// Prefer an address inside angle brackets, then a value that is itself a
/// valid address, then the first address-shaped substring.
pub fn normalize_address(candidate: &str) -> Option<String> {
    let candidate = candidate.trim();
    if candidate.is_empty() {
        return None;
    }

    if let Some(inner) = ANGLE_ADDRESS
        .captures_iter(candidate)
        .map(|c| c.get(1).map(|m| m.as_str()).unwrap_or(""))
        .find(|inner| is_valid_address(inner))
    {
        return Some(inner.to_string());
    }

    if is_valid_address(candidate) {
        return Some(candidate.to_string());
    }

    ADDRESS_LIKE
        .find(candidate)
        .map(|m| m.as_str().trim_matches('.').to_string())
        .filter(|a| is_valid_address(a))
}

pub fn is_valid_address(candidate: &str) -> bool {
    candidate.len() <= 254 && VALID_ADDRESS.is_match(candidate)
}

/// Best-effort originating client address for report suppression.
pub fn originating_address(headers: &HeaderMap, invocation: &Invocation) -> Option<String> {
    lazy_static! {
        static ref BRACKETED_IP: Regex =
            Regex::new(r"\[((?:\d{1,3}\.){3}\d{1,3}|[0-9A-Fa-f:]*:[0-9A-Fa-f:.]+)\]").unwrap();
    }

    if let Some(addr) = &invocation.client_address {
        return Some(addr.clone());
    }
    if let Some(value) = headers.get("X-Originating-IP") {
        let value = value.trim().trim_start_matches('[').trim_end_matches(']');
        if value.parse::<std::net::IpAddr>().is_ok() {
            return Some(value.to_string());
        }
    }
    headers.get("Received").and_then(|received| {
        BRACKETED_IP
            .captures(received)
            .map(|c| c[1].to_string())
            .filter(|ip| ip.parse::<std::net::IpAddr>().is_ok())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (n, v) in pairs {
            map.insert(*n, *v);
        }
        map
    }

    fn resolver() -> RecipientResolver {
        RecipientResolver::new(
            vec!["ORIGINAL_RECIPIENT".to_string(), "RECIPIENT".to_string()],
            Some("example.com".to_string()),
        )
    }

    #[test]
    fn test_to_header_wins() {
        let h = headers(&[
            ("X-Original-To", "orig@example.com"),
            ("Delivered-To", "delivered@example.com"),
            ("To", "Alice <alice@example.com>"),
        ]);
        let resolved = resolver().resolve(&h, &Invocation::default()).unwrap();
        assert_eq!(resolved.address, "alice@example.com");
        assert_eq!(resolved.source, RecipientSource::Header("To".to_string()));
    }

    #[test]
    fn test_falls_through_header_order() {
        let h = headers(&[("To", "undisclosed-recipients:;"), ("X-Original-To", "orig@example.com")]);
        let resolved = resolver().resolve(&h, &Invocation::default()).unwrap();
        assert_eq!(resolved.address, "orig@example.com");
    }

    #[test]
    fn test_environment_then_arguments() {
        let h = headers(&[("Subject", "hi")]);
        let mut inv = Invocation::default();
        inv.recipient_arg = Some("arg@example.net".to_string());
        inv.env.insert("RECIPIENT".to_string(), "env@example.net".to_string());
        let resolved = resolver().resolve(&h, &inv).unwrap();
        assert_eq!(resolved.address, "env@example.net");

        inv.env.clear();
        let resolved = resolver().resolve(&h, &inv).unwrap();
        assert_eq!(resolved.source, RecipientSource::RecipientArgument);

        inv.recipient_arg = None;
        inv.args = vec!["-x".to_string(), "user@example.org".to_string()];
        let resolved = resolver().resolve(&h, &inv).unwrap();
        assert_eq!(resolved.address, "user@example.org");
        assert_eq!(resolved.source, RecipientSource::Argument);
    }

    #[test]
    fn test_header_scan_skips_sender_headers() {
        let h = headers(&[
            ("From", "boss@example.com"),
            ("Received", "from mx by host for <bob@example.com>; Mon"),
        ]);
        let resolved = resolver().resolve(&h, &Invocation::default()).unwrap();
        assert_eq!(resolved.address, "bob@example.com");
        assert_eq!(resolved.source, RecipientSource::HeaderScan("Received".to_string()));
    }

    #[test]
    fn test_not_found() {
        let h = headers(&[("From", "boss@example.com"), ("Subject", "x")]);
        assert_eq!(
            resolver().resolve(&h, &Invocation::default()).unwrap_err(),
            RecipientError::NotFound
        );
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("Bob <bob@x.org>").as_deref(), Some("bob@x.org"));
        assert_eq!(normalize_address(" bob@x.org ").as_deref(), Some("bob@x.org"));
        assert_eq!(
            normalize_address("reach me at bob@x.org today").as_deref(),
            Some("bob@x.org")
        );
        assert_eq!(normalize_address("<>"), None);
        assert_eq!(normalize_address("nobody"), None);
    }

    #[test]
    fn test_resolve_sender() {
        let h = headers(&[("From", "Alice <alice@x.org>"), ("Return-Path", "<bounce@x.org>")]);
        assert_eq!(
            resolve_sender(&h, &Invocation::default()).as_deref(),
            Some("bounce@x.org")
        );
        let h = headers(&[("Return-Path", "<>")]);
        assert_eq!(resolve_sender(&h, &Invocation::default()), None);
    }

    #[test]
    fn test_originating_address() {
        let h = headers(&[("Received", "from relay (relay [203.0.113.9]) by mx")]);
        assert_eq!(
            originating_address(&h, &Invocation::default()).as_deref(),
            Some("203.0.113.9")
        );
    }
}
