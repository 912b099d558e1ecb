//! Delivery Subsystem
//!
//! A closed set of backends behind one `Deliver` contract. Every message goes
//! through `Dispatcher`, which stamps the loop-protection header before the
//! backend sees it.

pub mod command;
pub mod smtp;
pub mod spool;

pub use command::{LdaBackend, SendmailBackend};
pub use smtp::SmtpBackend;
pub use spool::{PickupBackend, QueueBackend};

use crate::config::DeliveryConfig;
use crate::message::OutgoingMessage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Loop-protection header naming the host that already filtered a message.
pub const PROCESSED_HEADER: &str = "X-Mailguard-Processed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMethod {
    Smtp,
    Sendmail,
    QueueDrop,
    Pickup,
    Lda,
}

impl DeliveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMethod::Smtp => "smtp",
            DeliveryMethod::Sendmail => "sendmail",
            DeliveryMethod::QueueDrop => "queue-drop",
            DeliveryMethod::Pickup => "pickup",
            DeliveryMethod::Lda => "lda",
        }
    }
}

impl fmt::Display for DeliveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("SMTP {stage} failed: {source}")]
    Smtp {
        stage: &'static str,
        #[source]
        source: lettre::transport::smtp::Error,
    },
    #[error("SMTP {stage} rejected: expected {expected}, got '{reply}'")]
    Protocol {
        stage: &'static str,
        expected: &'static str,
        reply: String,
    },
    #[error("I/O error during {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    ProgramFailed {
        program: PathBuf,
        status: String,
        stderr: String,
    },
    #[error("invalid envelope address '{0}'")]
    InvalidAddress(String),
    #[error("delivery misconfigured: {0}")]
    Misconfigured(String),
}

impl DeliveryError {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> DeliveryError {
        let context = context.into();
        move |source| DeliveryError::Io { context, source }
    }
}

/// SMTP envelope. An empty sender is the null reverse path used for bounces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender: String,
    pub recipient: String,
}

impl Envelope {
    pub fn new(sender: impl Into<String>, recipient: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
        }
    }
}

pub trait Deliver {
    fn name(&self) -> &'static str;

    fn deliver(&self, message: &OutgoingMessage, envelope: &Envelope) -> Result<(), DeliveryError>;
}

pub enum Backend {
    Smtp(SmtpBackend),
    Sendmail(SendmailBackend),
    QueueDrop(QueueBackend),
    Pickup(PickupBackend),
    Lda(LdaBackend),
}

impl Backend {
    pub fn from_config(config: &DeliveryConfig, hostname: &str) -> Result<Self, DeliveryError> {
        let backend = match config.method {
            DeliveryMethod::Smtp => Backend::Smtp(SmtpBackend::new(&config.smtp, hostname)),
            DeliveryMethod::Sendmail => Backend::Sendmail(SendmailBackend::new(&config.sendmail)),
            DeliveryMethod::QueueDrop => {
                let directory = config.queue.directory.clone().ok_or_else(|| {
                    DeliveryError::Misconfigured("queue directory not set".to_string())
                })?;
                Backend::QueueDrop(QueueBackend::new(
                    directory,
                    config.queue.owner_uid,
                    config.queue.owner_gid,
                    hostname,
                ))
            }
            DeliveryMethod::Pickup => {
                let directory = config.pickup.directory.clone().ok_or_else(|| {
                    DeliveryError::Misconfigured("pickup directory not set".to_string())
                })?;
                Backend::Pickup(PickupBackend::new(directory, hostname))
            }
            DeliveryMethod::Lda => {
                let path = config
                    .lda
                    .path
                    .clone()
                    .ok_or_else(|| DeliveryError::Misconfigured("LDA path not set".to_string()))?;
                Backend::Lda(LdaBackend::new(path, config.lda.args.clone()))
            }
        };
        Ok(backend)
    }

    fn inner(&self) -> &dyn Deliver {
        match self {
            Backend::Smtp(b) => b,
            Backend::Sendmail(b) => b,
            Backend::QueueDrop(b) => b,
            Backend::Pickup(b) => b,
            Backend::Lda(b) => b,
        }
    }
}

impl Deliver for Backend {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn deliver(&self, message: &OutgoingMessage, envelope: &Envelope) -> Result<(), DeliveryError> {
        self.inner().deliver(message, envelope)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub backend: &'static str,
    pub success: bool,
    pub attempt: u32,
    pub error: Option<String>,
}

/// Stamps the loop-protection header and hands the message to a backend.
pub struct Dispatcher<'a> {
    backend: &'a dyn Deliver,
    hostname: String,
}

impl<'a> Dispatcher<'a> {
    pub fn new(backend: &'a dyn Deliver, hostname: &str) -> Self {
        Self {
            backend,
            hostname: hostname.to_string(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn dispatch(
        &self,
        mut message: OutgoingMessage,
        envelope: &Envelope,
        attempt: u32,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        if !message.has_header(PROCESSED_HEADER) {
            message.add_header(PROCESSED_HEADER, &self.hostname);
        }

        match self.backend.deliver(&message, envelope) {
            Ok(()) => {
                let outcome = DeliveryOutcome {
                    backend: self.backend.name(),
                    success: true,
                    attempt,
                    error: None,
                };
                log::info!(
                    "Delivered to {} via {} (attempt {attempt})",
                    envelope.recipient,
                    outcome.backend
                );
                Ok(outcome)
            }
            Err(e) => {
                log::warn!(
                    "Delivery to {} via {} failed (attempt {attempt}): {e}",
                    envelope.recipient,
                    self.backend.name()
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;

    /// Backend that fails a scripted number of times, then records messages.
    pub struct FakeBackend {
        failures_left: RefCell<u32>,
        pub delivered: RefCell<Vec<(String, Envelope)>>,
        pub raw: RefCell<Vec<Vec<u8>>>,
        pub calls: RefCell<u32>,
    }

    impl FakeBackend {
        pub fn new() -> Self {
            Self::failing(0)
        }

        pub fn failing(times: u32) -> Self {
            Self {
                failures_left: RefCell::new(times),
                delivered: RefCell::new(Vec::new()),
                raw: RefCell::new(Vec::new()),
                calls: RefCell::new(0),
            }
        }

        pub fn always_failing() -> Self {
            Self::failing(u32::MAX)
        }
    }

    impl Deliver for FakeBackend {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn deliver(&self, message: &OutgoingMessage, envelope: &Envelope) -> Result<(), DeliveryError> {
            *self.calls.borrow_mut() += 1;
            let mut left = self.failures_left.borrow_mut();
            if *left > 0 {
                *left -= 1;
                return Err(DeliveryError::Io {
                    context: "connecting to fake".to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
                });
            }
            self.delivered
                .borrow_mut()
                .push((message.to_message_string(), envelope.clone()));
            self.raw.borrow_mut().push(message.to_bytes());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeBackend;
    use super::*;

    #[test]
    fn test_dispatch_adds_processed_header_once() {
        let backend = FakeBackend::new();
        let dispatcher = Dispatcher::new(&backend, "mx1");
        let envelope = Envelope::new("a@example.com", "b@example.com");

        let message = OutgoingMessage::new(&[("Subject", "hi")], "body\n");
        let outcome = dispatcher.dispatch(message, &envelope, 1).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.backend, "fake");

        let already = OutgoingMessage::new(&[("Subject", "hi"), (PROCESSED_HEADER, "mx0")], "body\n");
        dispatcher.dispatch(already, &envelope, 1).unwrap();

        let delivered = backend.delivered.borrow();
        assert!(delivered[0].0.contains("X-Mailguard-Processed: mx1"));
        assert_eq!(delivered[1].0.matches(PROCESSED_HEADER).count(), 1);
        assert!(delivered[1].0.contains("X-Mailguard-Processed: mx0"));
    }

    #[test]
    fn test_dispatch_propagates_failure() {
        let backend = FakeBackend::failing(1);
        let dispatcher = Dispatcher::new(&backend, "mx1");
        let envelope = Envelope::new("", "b@example.com");
        let message = OutgoingMessage::new(&[("Subject", "hi")], "body\n");
        assert!(dispatcher.dispatch(message, &envelope, 1).is_err());
    }

    #[test]
    fn test_backend_from_config_requires_settings() {
        let mut config = DeliveryConfig::default();
        config.method = DeliveryMethod::Lda;
        assert!(matches!(
            Backend::from_config(&config, "mx"),
            Err(DeliveryError::Misconfigured(_))
        ));
        config.method = DeliveryMethod::Sendmail;
        assert_eq!(Backend::from_config(&config, "mx").unwrap().name(), "sendmail");
    }
}
