use super::{Deliver, DeliveryError, Envelope};
use crate::config::SmtpConfig;
use crate::message::OutgoingMessage;
use lettre::transport::smtp::client::SmtpConnection;
use lettre::transport::smtp::commands::{Data, Mail, Quit, Rcpt};
use lettre::transport::smtp::extension::ClientId;
use lettre::transport::smtp::response::Response;
use lettre::Address;
use std::time::Duration;

type SmtpResult = Result<Response, lettre::transport::smtp::Error>;

/// HELO command; `lettre` only ships `Ehlo`.
struct Helo {
    client_id: ClientId,
}

impl Helo {
    fn new(client_id: ClientId) -> Self {
        Self { client_id }
    }
}

impl std::fmt::Display for Helo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HELO {}\r\n", self.client_id)
    }
}

/// Re-injection into the smart host over plain SMTP.
pub struct SmtpBackend {
    host: String,
    port: u16,
    helo_name: String,
    connect_timeout: Duration,
    timeout: Duration,
}

impl SmtpBackend {
    pub fn new(config: &SmtpConfig, hostname: &str) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            helo_name: config.helo_name.clone().unwrap_or_else(|| hostname.to_string()),
            connect_timeout: Duration::from_secs(config.connect_timeout_seconds.max(1)),
            timeout: Duration::from_secs(config.timeout_seconds.max(1)),
        }
    }

    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn connect(&self, client_id: &ClientId) -> Result<SmtpConnection, DeliveryError> {
        let mut connection = SmtpConnection::connect(
            (self.host.as_str(), self.port),
            Some(self.connect_timeout),
            client_id,
            None,
            None,
        )
        .map_err(|source| DeliveryError::Smtp {
            stage: "greeting",
            source,
        })?;
        connection
            .set_timeout(Some(self.timeout))
            .map_err(DeliveryError::io("setting socket timeouts"))?;
        log::debug!("Connected to smart host {}", self.target());
        Ok(connection)
    }
}

impl Deliver for SmtpBackend {
    fn name(&self) -> &'static str {
        "smtp"
    }

    fn deliver(&self, message: &OutgoingMessage, envelope: &Envelope) -> Result<(), DeliveryError> {
        let sender = parse_address(&envelope.sender, true)?;
        let recipient = parse_address(&envelope.recipient, false)?
            .ok_or_else(|| DeliveryError::InvalidAddress(envelope.recipient.clone()))?;

        let client_id = ClientId::Domain(self.helo_name.clone());
        let mut connection = self.connect(&client_id)?;

        expect("HELO", connection.command(Helo::new(client_id)), &[250], "250")?;
        expect("MAIL FROM", connection.command(Mail::new(sender, vec![])), &[250], "250")?;
        expect("RCPT TO", connection.command(Rcpt::new(recipient, vec![])), &[250, 251], "250 or 251")?;
        expect("DATA", connection.command(Data), &[354], "354")?;
        expect("end of data", connection.message(&crlf_lines(&message.to_bytes())), &[250], "250")?;

        // The message is accepted at this point; a failed QUIT changes nothing.
        if let Err(e) = expect("QUIT", connection.command(Quit), &[221], "221") {
            log::warn!("SMTP QUIT failed after successful delivery: {e}");
        }
        Ok(())
    }
}

/// An empty sender is the null reverse path and only allowed for MAIL FROM.
fn parse_address(address: &str, allow_null: bool) -> Result<Option<Address>, DeliveryError> {
    if address.is_empty() && allow_null {
        return Ok(None);
    }
    address
        .parse::<Address>()
        .map(Some)
        .map_err(|_| DeliveryError::InvalidAddress(address.to_string()))
}

fn expect(
    stage: &'static str,
    reply: SmtpResult,
    accepted: &[u16],
    expected: &'static str,
) -> Result<(), DeliveryError> {
    let response = reply.map_err(|source| DeliveryError::Smtp { stage, source })?;
    log::trace!("SMTP {stage}: {} {}", response.code(), response.first_line().unwrap_or(""));
    if accepted.iter().any(|&code| response.has_code(code)) {
        Ok(())
    } else {
        Err(DeliveryError::Protocol {
            stage,
            expected,
            reply: format!("{} {}", response.code(), response.first_line().unwrap_or("")),
        })
    }
}

/// Bare LF line endings become CRLF. The connection dot-stuffs and adds the
/// terminating `.` line itself.
pub fn crlf_lines(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 64);
    let mut previous = 0u8;
    for &byte in message {
        if byte == b'\n' && previous != b'\r' {
            out.push(b'\r');
        }
        out.push(byte);
        previous = byte;
    }
    out
}
