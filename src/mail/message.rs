//! Message view used by the poller, plus the mail-parser backed implementation.

use chrono::{DateTime, Utc};
use mail_parser::MessageParser;

/// Everything the poller and the collaborators need to know about a message.
///
/// Any backend that can produce these fields can feed the poller.
pub trait MailMessage: Send + Sync {
    /// Protocol-assigned identifier, unique within its folder.
    fn uid(&self) -> u32;
    /// Sender address.
    fn sender(&self) -> &str;
    fn subject(&self) -> &str;
    fn date(&self) -> Option<DateTime<Utc>>;
    /// Plain-text body, if the message has one.
    fn text(&self) -> Option<&str>;
    /// HTML body, if the message has one.
    fn html(&self) -> Option<&str>;
    /// Raw header value, looked up case-insensitively.
    fn header(&self, name: &str) -> Option<&str>;

    /// The `Message-ID` header, angle brackets included.
    fn message_id(&self) -> Option<&str> {
        self.header("Message-ID")
    }

    /// The `References` header of the original message.
    fn references(&self) -> Option<&str> {
        self.header("References")
    }

    /// Text suitable for a prompt: plain text, else HTML without tags.
    fn readable_body(&self) -> String {
        if let Some(text) = self.text().filter(|t| !t.trim().is_empty()) {
            return text.to_string();
        }
        if let Some(html) = self.html() {
            return strip_html(html);
        }
        "(no readable content)".to_string()
    }
}

/// A fully parsed RFC 822 message with owned fields.
#[derive(Debug, Clone)]
pub struct ParsedEmail {
    uid: u32,
    sender: String,
    subject: String,
    date: Option<DateTime<Utc>>,
    text: Option<String>,
    html: Option<String>,
    headers: Vec<(String, String)>,
}

impl ParsedEmail {
    /// A message with only the essentials set; used to build messages by hand.
    pub fn new(uid: u32, sender: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            uid,
            sender: sender.into(),
            subject: subject.into(),
            date: None,
            text: None,
            html: None,
            headers: Vec::new(),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Parse raw RFC 822 bytes. Returns `None` if mail-parser rejects them.
    pub fn parse(uid: u32, raw: &[u8]) -> Option<Self> {
        let parsed = MessageParser::default().parse(raw)?;

        let sender = extract_sender(&parsed);
        let subject = parsed.subject().unwrap_or("(no subject)").to_string();
        let date = parsed
            .date()
            .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0));
        let text = parsed.body_text(0).map(|t| t.into_owned());
        let html = parsed.body_html(0).map(|h| h.into_owned());
        let headers = parsed
            .headers_raw()
            .map(|(name, value)| (name.to_string(), unfold_header(value)))
            .collect();

        Some(Self {
            uid,
            sender,
            subject,
            date,
            text,
            html,
            headers,
        })
    }
}

impl MailMessage for ParsedEmail {
    fn uid(&self) -> u32 {
        self.uid
    }

    fn sender(&self) -> &str {
        &self.sender
    }

    fn subject(&self) -> &str {
        &self.subject
    }

    fn date(&self) -> Option<DateTime<Utc>> {
        self.date
    }

    fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    fn html(&self) -> Option<&str> {
        self.html.as_deref()
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Extract the sender address from a parsed email.
fn extract_sender(parsed: &mail_parser::Message) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into())
}

/// Join folded header lines and trim surrounding whitespace.
fn unfold_header(value: &str) -> String {
    value
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}
