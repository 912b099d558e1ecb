use lazy_static::lazy_static;
use regex::Regex;
use url::Url;

lazy_static! {
    static ref HTTP_URL: Regex = Regex::new(r#"(?i)https?://[^\s"'<>()\[\]]+"#).unwrap();
}

/// Minimal address and host helpers
pub struct DomainUtils;

impl DomainUtils {
    /// Extract domain from email address
    pub fn extract_domain(email: &str) -> Option<String> {
        email
            .rsplit_once('@')
            .map(|(_, d)| d.trim_end_matches('>').to_lowercase())
            .filter(|d| !d.is_empty())
    }

    /// Local part of an address, without any `+extension`
    pub fn mailbox_user(email: &str) -> Option<String> {
        let (local, _) = email.rsplit_once('@')?;
        let local = local.trim_start_matches('<');
        let user = local.split('+').next().unwrap_or(local);
        if user.is_empty() {
            None
        } else {
            Some(user.to_string())
        }
    }

    /// Hosts of every `http(s)://` link in `text`, lower-cased, in order.
    pub fn extract_url_hosts(text: &str) -> Vec<String> {
        HTTP_URL
            .find_iter(text)
            .filter_map(|m| {
                let candidate = m.as_str().trim_end_matches(['.', ',', ';', '!', '?']);
                match Url::parse(candidate) {
                    Ok(url) => url.host_str().map(|h| h.to_lowercase()),
                    Err(e) => {
                        log::debug!("Skipping unparsable link {candidate}: {e}");
                        None
                    }
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_domain() {
        assert_eq!(
            DomainUtils::extract_domain("user@Example.com"),
            Some("example.com".to_string())
        );
        assert_eq!(DomainUtils::extract_domain("invalid"), None);
    }

    #[test]
    fn test_mailbox_user() {
        assert_eq!(
            DomainUtils::mailbox_user("bob+lists@example.com"),
            Some("bob".to_string())
        );
        assert_eq!(DomainUtils::mailbox_user("@example.com"), None);
    }

    #[test]
    fn test_extract_url_hosts() {
        let text = "Click https://Login.Example-Bank.com/verify?x=1, or http://evil.test.";
        assert_eq!(
            DomainUtils::extract_url_hosts(text),
            vec!["login.example-bank.com".to_string(), "evil.test".to_string()]
        );
        assert!(DomainUtils::extract_url_hosts("no links here").is_empty());
    }
}
