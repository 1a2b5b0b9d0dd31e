//! Mail I/O: IMAP folder scanning and SMTP reply delivery.

pub mod imap;
pub mod message;
pub mod smtp;

pub use imap::{ImapMailSource, ImapSession};
pub use message::{MailMessage, ParsedEmail};
pub use smtp::SmtpReplySender;

use async_trait::async_trait;

use crate::error::MailError;

/// A drafted reply ready to be confirmed and sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyContent {
    pub subject: String,
    /// Plain-text body.
    pub body: String,
    /// Optional rich-text alternative.
    pub html: Option<String>,
}

/// Opens mail sessions. One session is used for a whole poll cycle.
#[async_trait]
pub trait MailSource: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn MailSession>, MailError>;
}

/// A logged-in session on the mail server.
#[async_trait]
pub trait MailSession: Send {
    /// Make `folder` the current folder.
    async fn select(&mut self, folder: &str) -> Result<(), MailError>;

    /// Every message in the current folder. No filtering by date or flags.
    async fn list_all(&mut self) -> Result<Vec<Box<dyn MailMessage>>, MailError>;

    /// Store a raw message in `folder`, marked as seen.
    async fn append(&mut self, folder: &str, raw: Vec<u8>) -> Result<(), MailError>;

    /// End the session. Best effort; errors are only logged.
    async fn logout(&mut self);
}

/// Delivers a reply to the sender of `original`.
#[async_trait]
pub trait ReplySender: Send + Sync {
    async fn send(
        &self,
        original: &dyn MailMessage,
        reply: &ReplyContent,
        folder: &str,
    ) -> Result<(), MailError>;
}
