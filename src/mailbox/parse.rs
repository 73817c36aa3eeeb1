//! Turning raw RFC 5322 sources into the fields ingestion needs.

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};

use crate::error::IngestError;
use crate::mailbox::client::RawMessage;

/// A parsed inbound email.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEmail {
    /// Lower-cased sender address.
    pub sender: String,
    /// Empty when the message has no subject.
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// Parse a fetched message. A message without a sender address is unusable.
pub fn parse_message(raw: &RawMessage) -> Result<InboundEmail, IngestError> {
    let parsed = MessageParser::default()
        .parse(raw.source.as_slice())
        .ok_or_else(|| IngestError::ParseFailed(format!("uid {}: not a valid message", raw.uid)))?;

    let sender = extract_sender(&parsed)
        .ok_or_else(|| IngestError::ParseFailed(format!("uid {}: no sender address", raw.uid)))?;

    let received_at = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    Ok(InboundEmail {
        sender,
        subject: parsed.subject().unwrap_or_default().trim().to_string(),
        body: extract_text(&parsed),
        received_at,
    })
}

fn extract_sender(parsed: &mail_parser::Message) -> Option<String> {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
}

/// Plain-text body, else the HTML body stripped of tags, else the first
/// text attachment. Empty if none exist.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0)
        && !text.trim().is_empty()
    {
        return text.trim().to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        let part: &mail_parser::MessagePart = part;
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            return text.trim().to_string();
        }
    }
    String::new()
}

/// Strip HTML tags and collapse whitespace.
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => {
                in_tag = true;
                result.push(' ');
            }
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}
