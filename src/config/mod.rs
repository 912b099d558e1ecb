use crate::delivery::DeliveryMethod;
use crate::detection::{Category, DetectionAlgorithm, PHISHING_THRESHOLD, VIRUS_THRESHOLD};
use crate::disposition::Action;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/mailguard/mailguard.yaml";
pub const SPAM_THRESHOLD_RANGE: std::ops::RangeInclusive<u32> = 30..=90;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to serialize configuration: {0}")]
    Serialize(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mail: MailConfig,
    pub spam: SpamConfig,
    pub detection: DetectionConfig,
    pub error: ErrorConfig,
    pub delivery: DeliveryConfig,
    pub store: StoreConfig,
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    /// Defaults to the system hostname.
    pub hostname: Option<String>,
    /// Domain whose addresses the last-resort header scan accepts.
    pub domain: Option<String>,
    pub recipient_env: Vec<String>,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            domain: None,
            recipient_env: vec!["ORIGINAL_RECIPIENT".to_string(), "RECIPIENT".to_string()],
        }
    }
}

impl MailConfig {
    pub fn hostname(&self) -> String {
        self.hostname.clone().unwrap_or_else(system_hostname)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpamConfig {
    pub threshold: u32,
    pub action: Action,
    pub quarantine_folder: String,
    pub maildir_path_template: String,
    pub hash_detection: bool,
    /// Key for fingerprint hashing. Falls back to the hostname when unset.
    pub hash_secret: Option<String>,
    pub subject_tag: String,
    pub footer: Option<String>,
    pub bounce_message: String,
    pub alias_map: Option<PathBuf>,
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            threshold: crate::detection::DEFAULT_SPAM_THRESHOLD,
            action: Action::Headers,
            quarantine_folder: "Spam".to_string(),
            maildir_path_template: "/var/vmail/{domain}/{user}/Maildir".to_string(),
            hash_detection: true,
            hash_secret: None,
            subject_tag: "***SPAM***".to_string(),
            footer: None,
            bounce_message: "Your message was rejected by the content filter of the receiving system."
                .to_string(),
            alias_map: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub phishing_threshold: u32,
    pub virus_threshold: u32,
    pub phishing_action: Option<Action>,
    pub virus_action: Option<Action>,
    pub rules: Vec<DetectionAlgorithm>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            phishing_threshold: PHISHING_THRESHOLD,
            virus_threshold: VIRUS_THRESHOLD,
            phishing_action: None,
            virus_action: None,
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnSystemError {
    Pass,
    Fail,
    Quarantine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorConfig {
    pub on_system_error: OnSystemError,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub fail_safe_mode: bool,
    pub fail_safe_footer: String,
    pub quarantine_dir: PathBuf,
    pub log_path: Option<PathBuf>,
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self {
            on_system_error: OnSystemError::Pass,
            max_retries: 3,
            retry_delay_seconds: 5,
            fail_safe_mode: true,
            fail_safe_footer: "[This message was delivered without content filtering because of a temporary system error.]"
                .to_string(),
            quarantine_dir: PathBuf::from("/var/lib/mailguard/system-errors"),
            log_path: Some(PathBuf::from("/var/log/mailguard/errors.log")),
        }
    }
}

impl ErrorConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub method: DeliveryMethod,
    pub smtp: SmtpConfig,
    pub sendmail: SendmailConfig,
    pub queue: QueueConfig,
    pub pickup: PickupConfig,
    pub lda: LdaConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            method: DeliveryMethod::Smtp,
            smtp: SmtpConfig::default(),
            sendmail: SendmailConfig::default(),
            queue: QueueConfig::default(),
            pickup: PickupConfig::default(),
            lda: LdaConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub helo_name: Option<String>,
    pub connect_timeout_seconds: u64,
    pub timeout_seconds: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 10026,
            helo_name: None,
            connect_timeout_seconds: 10,
            timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SendmailConfig {
    pub path: PathBuf,
    /// Extra arguments. Empty means `-i -f <sender> -- <recipient>`.
    pub args: Vec<String>,
}

impl Default for SendmailConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/usr/sbin/sendmail"),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub directory: Option<PathBuf>,
    pub owner_uid: Option<u32>,
    pub owner_gid: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PickupConfig {
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LdaConfig {
    pub path: Option<PathBuf>,
    pub args: Vec<String>,
}

impl Default for LdaConfig {
    fn default() -> Self {
        Self {
            path: None,
            args: vec![
                "-d".to_string(),
                "{user}".to_string(),
                "-f".to_string(),
                "{sender}".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/mailguard/policy.db"),
            busy_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
    /// Defaults to the hostname.
    pub client_id: Option<String>,
    pub timeout_seconds: u64,
    pub interval_seconds: u64,
    pub report_ttl_seconds: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            client_id: None,
            timeout_seconds: 10,
            interval_seconds: 3600,
            report_ttl_seconds: 86400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load YAML, or TOML when the file name ends in `.toml`.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if path.extension().is_some_and(|ext| ext == "toml") {
            Self::from_toml_str(&content)
        } else {
            Self::from_yaml_str(&content)
        }
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = if path.extension().is_some_and(|ext| ext == "toml") {
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else {
            serde_yaml::to_string(self)?
        };
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !SPAM_THRESHOLD_RANGE.contains(&self.spam.threshold) {
            return Err(ConfigError::Invalid(format!(
                "spam.threshold {} is outside {}..={}",
                self.spam.threshold,
                SPAM_THRESHOLD_RANGE.start(),
                SPAM_THRESHOLD_RANGE.end()
            )));
        }
        if self.error.max_retries == 0 {
            return Err(ConfigError::Invalid("error.max_retries must be at least 1".to_string()));
        }
        if self.spam.quarantine_folder.trim().is_empty() || self.spam.quarantine_folder.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "spam.quarantine_folder '{}' is not a valid folder name",
                self.spam.quarantine_folder
            )));
        }

        let delivery = &self.delivery;
        match delivery.method {
            DeliveryMethod::Smtp if delivery.smtp.host.trim().is_empty() => {
                return Err(ConfigError::Invalid("delivery.smtp.host is required".to_string()));
            }
            DeliveryMethod::QueueDrop if delivery.queue.directory.is_none() => {
                return Err(ConfigError::Invalid("delivery.queue.directory is required".to_string()));
            }
            DeliveryMethod::Pickup if delivery.pickup.directory.is_none() => {
                return Err(ConfigError::Invalid("delivery.pickup.directory is required".to_string()));
            }
            DeliveryMethod::Lda if delivery.lda.path.is_none() => {
                return Err(ConfigError::Invalid("delivery.lda.path is required".to_string()));
            }
            _ => {}
        }

        if self.sync.enabled && self.sync.endpoint.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::Invalid(
                "sync.endpoint is required when sync is enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn threshold(&self, category: Category) -> u32 {
        match category {
            Category::Spam => self.spam.threshold,
            Category::Phishing => self.detection.phishing_threshold,
            Category::Virus => self.detection.virus_threshold,
        }
    }

    /// Action for a threat of this category.
    pub fn action_for(&self, category: Category) -> Action {
        let specific = match category {
            Category::Spam => None,
            Category::Phishing => self.detection.phishing_action,
            Category::Virus => self.detection.virus_action,
        };
        specific.unwrap_or(self.spam.action)
    }

    pub fn hash_secret(&self) -> String {
        self.spam.hash_secret.clone().unwrap_or_else(|| self.mail.hostname())
    }
}

pub fn system_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = Config::from_yaml_str("").unwrap();
        assert_eq!(config.spam.threshold, 50);
        assert_eq!(config.spam.action, Action::Headers);
        assert_eq!(config.error.max_retries, 3);
        assert_eq!(config.error.on_system_error, OnSystemError::Pass);
        assert_eq!(config.delivery.method, DeliveryMethod::Smtp);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
spam:
  threshold: 70
  action: quarantine
error:
  on_system_error: quarantine
delivery:
  method: queue-drop
  queue:
    directory: /var/spool/postfix/maildrop
detection:
  phishing_action: reject
  rules:
    - name: casino
      category: spam
      detection_type: keyword
      pattern: casino
      score: 30
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.spam.threshold, 70);
        assert_eq!(config.spam.quarantine_folder, "Spam");
        assert_eq!(config.delivery.method, DeliveryMethod::QueueDrop);
        assert_eq!(config.detection.rules.len(), 1);
        assert_eq!(config.detection.rules[0].target, "subject,body");
        assert_eq!(config.action_for(Category::Spam), Action::Quarantine);
        assert_eq!(config.action_for(Category::Phishing), Action::Reject);
        assert_eq!(config.action_for(Category::Virus), Action::Quarantine);
    }

    #[test]
    fn test_toml() {
        let config = Config::from_toml_str(
            r#"
[spam]
threshold = 40

[delivery]
method = "sendmail"
"#,
        )
        .unwrap();
        assert_eq!(config.spam.threshold, 40);
        assert_eq!(config.delivery.method, DeliveryMethod::Sendmail);
    }

    #[test]
    fn test_threshold_out_of_range() {
        let mut config = Config::default();
        config.spam.threshold = 95;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.spam.threshold = 29;
        assert!(config.validate().is_err());
        config.spam.threshold = 30;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backend_settings_required() {
        let mut config = Config::default();
        config.delivery.method = DeliveryMethod::Pickup;
        assert!(config.validate().is_err());
        config.delivery.pickup.directory = Some(PathBuf::from("/tmp"));
        assert!(config.validate().is_ok());

        config.error.max_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_generated_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mailguard.yaml");
        Config::default().to_file(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.spam.subject_tag, "***SPAM***");
        assert_eq!(loaded.mail.recipient_env, vec!["ORIGINAL_RECIPIENT", "RECIPIENT"]);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file(Path::new("/nonexistent/mailguard.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_system_hostname_not_empty() {
        assert!(!system_hostname().is_empty());
    }
}
