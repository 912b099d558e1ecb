use super::{Deliver, DeliveryError, Envelope};
use crate::config::SendmailConfig;
use crate::domain_utils::DomainUtils;
use crate::message::OutgoingMessage;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

/// Local injection through a sendmail-compatible program.
pub struct SendmailBackend {
    path: PathBuf,
    args: Vec<String>,
}

impl SendmailBackend {
    pub fn new(config: &SendmailConfig) -> Self {
        Self {
            path: config.path.clone(),
            args: config.args.clone(),
        }
    }

    fn arguments(&self, envelope: &Envelope) -> Vec<String> {
        let sender = if envelope.sender.is_empty() {
            "<>"
        } else {
            envelope.sender.as_str()
        };
        if self.args.is_empty() {
            return vec![
                "-i".to_string(),
                "-f".to_string(),
                sender.to_string(),
                "--".to_string(),
                envelope.recipient.clone(),
            ];
        }
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{sender}", sender)
                    .replace("{recipient}", &envelope.recipient)
            })
            .collect()
    }
}

impl Deliver for SendmailBackend {
    fn name(&self) -> &'static str {
        "sendmail"
    }

    fn deliver(&self, message: &OutgoingMessage, envelope: &Envelope) -> Result<(), DeliveryError> {
        pipe_to_program(&self.path, &self.arguments(envelope), message)
    }
}

/// Final delivery through a local delivery agent such as `dovecot-lda`.
pub struct LdaBackend {
    path: PathBuf,
    args: Vec<String>,
}

impl LdaBackend {
    pub fn new(path: PathBuf, args: Vec<String>) -> Self {
        Self { path, args }
    }

    fn arguments(&self, envelope: &Envelope) -> Result<Vec<String>, DeliveryError> {
        let user = DomainUtils::mailbox_user(&envelope.recipient).ok_or_else(|| {
            DeliveryError::Misconfigured(format!(
                "cannot derive a mailbox user from '{}'",
                envelope.recipient
            ))
        })?;
        let sender = if envelope.sender.is_empty() {
            "MAILER-DAEMON"
        } else {
            envelope.sender.as_str()
        };
        Ok(self
            .args
            .iter()
            .map(|arg| {
                arg.replace("{user}", &user)
                    .replace("{recipient}", &envelope.recipient)
                    .replace("{sender}", sender)
            })
            .collect())
    }
}

impl Deliver for LdaBackend {
    fn name(&self) -> &'static str {
        "lda"
    }

    fn deliver(&self, message: &OutgoingMessage, envelope: &Envelope) -> Result<(), DeliveryError> {
        let args = self.arguments(envelope)?;
        pipe_to_program(&self.path, &args, message)
    }
}

/// Run `program`, feed the message on stdin and require a zero exit status.
/// Stdin is written from its own thread while stderr is drained here, so a
/// chatty child cannot stall on a full pipe.
fn pipe_to_program(program: &Path, args: &[String], message: &OutgoingMessage) -> Result<(), DeliveryError> {
    log::debug!("Running {} {:?}", program.display(), args);
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| DeliveryError::Spawn {
            program: program.to_path_buf(),
            source,
        })?;

    let input = message.to_bytes();
    let writer = child
        .stdin
        .take()
        .map(|mut stdin| thread::spawn(move || stdin.write_all(&input)));

    let output = child
        .wait_with_output()
        .map_err(DeliveryError::io(format!("waiting for {}", program.display())))?;
    let write_result = match writer {
        Some(handle) => handle
            .join()
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "stdin writer panicked"))),
        None => Ok(()),
    };

    if !output.status.success() {
        return Err(DeliveryError::ProgramFailed {
            program: program.to_path_buf(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    write_result.map_err(DeliveryError::io(format!("writing to {}", program.display())))
}
