use crate::message::{OutgoingMessage, ParsedMessage};

pub const BOUNCE_SUBJECT: &str = "Undelivered Mail Returned to Sender";

/// Non-delivery report for `sender`, quoting the original header block.
/// Delivered with an empty envelope sender so it can never bounce back.
pub fn build_bounce(
    hostname: &str,
    sender: &str,
    original_recipient: &str,
    explanation: &str,
    reason: &str,
    original: &ParsedMessage,
) -> OutgoingMessage {
    let from = format!("MAILER-DAEMON@{hostname}");
    let date = chrono::Local::now().to_rfc2822();
    let original_subject = original.subject();

    let mut body = String::new();
    body.push_str(explanation.trim_end());
    body.push_str("\n\n");
    body.push_str(&format!("Recipient: {original_recipient}\n"));
    body.push_str(&format!("Reason: {reason}\n"));
    if !original_subject.is_empty() {
        body.push_str(&format!("Subject: {original_subject}\n"));
    }
    body.push_str("\n----- Original message headers -----\n\n");
    for line in original.raw_headers().lines() {
        body.push_str(line);
        body.push('\n');
    }

    OutgoingMessage::new(
        &[
            ("From", &format!("Mail Delivery System <{from}>")),
            ("To", sender),
            ("Subject", BOUNCE_SUBJECT),
            ("Date", &date),
            ("Auto-Submitted", "auto-replied"),
            ("MIME-Version", "1.0"),
            ("Content-Type", "text/plain; charset=utf-8"),
        ],
        &body,
    )
}
