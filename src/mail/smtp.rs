//! SMTP reply delivery via lettre, with a copy saved to the source folder.

use std::sync::Arc;

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EmailConfig;
use crate::error::MailError;
use crate::mail::{MailMessage, MailSource, ReplyContent, ReplySender};

/// Port on which SMTP expects TLS from the first byte.
const IMPLICIT_TLS_PORT: u16 = 465;

/// Build the reply to `original`, threaded under it.
pub fn build_reply(
    from: &str,
    original: &dyn MailMessage,
    reply: &ReplyContent,
) -> Result<Message, MailError> {
    let from_box: Mailbox = from
        .parse()
        .map_err(|e| MailError::Build(format!("Invalid from address: {e}")))?;
    let to_box: Mailbox = original
        .sender()
        .parse()
        .map_err(|e| MailError::Build(format!("Invalid to address: {e}")))?;

    let domain = from.rsplit_once('@').map_or("localhost", |(_, d)| d);

    let mut builder = Message::builder()
        .from(from_box)
        .to(to_box)
        .subject(reply.subject.clone())
        .message_id(Some(format!("<{}@{}>", Uuid::new_v4(), domain)))
        .date_now();

    if let Some(parent) = original.message_id() {
        let references = match original.references() {
            Some(prior) => format!("{prior} {parent}"),
            None => parent.to_string(),
        };
        builder = builder
            .in_reply_to(parent.to_string())
            .references(references);
    }

    let built = match &reply.html {
        Some(html) => builder.multipart(MultiPart::alternative_plain_html(
            reply.body.clone(),
            html.clone(),
        )),
        None => builder.singlepart(SinglePart::plain(reply.body.clone())),
    };
    built.map_err(|e| MailError::Build(e.to_string()))
}

/// Sends replies over SMTP and files a copy next to the original.
pub struct SmtpReplySender {
    config: EmailConfig,
    /// Where sent replies are appended; `None` disables saving.
    archive: Option<Arc<dyn MailSource>>,
}

impl SmtpReplySender {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            archive: None,
        }
    }

    /// Also append each sent reply to the folder it answers.
    pub fn with_archive(mut self, source: Arc<dyn MailSource>) -> Self {
        self.archive = Some(source);
        self
    }

    async fn deliver(&self, email: Message, to: &str) -> Result<(), MailError> {
        let config = self.config.clone();
        let send_err = |reason: String| MailError::SendFailed {
            to: to.to_string(),
            reason,
        };

        tokio::task::spawn_blocking(move || {
            let creds = Credentials::new(
                config.address.clone(),
                config.password.expose_secret().to_string(),
            );
            let relay = if config.smtp_port == IMPLICIT_TLS_PORT {
                SmtpTransport::relay(&config.smtp_host)
            } else {
                SmtpTransport::starttls_relay(&config.smtp_host)
            };
            let transport = relay
                .map_err(|e| format!("SMTP relay error: {e}"))?
                .port(config.smtp_port)
                .credentials(creds)
                .build();
            transport
                .send(&email)
                .map(|_| ())
                .map_err(|e| format!("SMTP send failed: {e}"))
        })
        .await
        .map_err(|e| MailError::Task(e.to_string()))?
        .map_err(send_err)
    }

    /// Append `raw` to `folder`. Failures are logged, never returned: by the
    /// time this runs the reply has already gone out.
    pub(crate) async fn save_copy(&self, folder: &str, raw: Vec<u8>) {
        let Some(source) = &self.archive else {
            return;
        };
        let mut session = match source.connect().await {
            Ok(s) => s,
            Err(e) => {
                warn!(folder, "Could not save reply to folder: {e}");
                return;
            }
        };
        match session.append(folder, raw).await {
            Ok(()) => info!(folder, "Reply saved to folder"),
            Err(e) => warn!(folder, "Could not save reply to folder: {e}"),
        }
        session.logout().await;
    }
}

#[async_trait]
impl ReplySender for SmtpReplySender {
    async fn send(
        &self,
        original: &dyn MailMessage,
        reply: &ReplyContent,
        folder: &str,
    ) -> Result<(), MailError> {
        let email = build_reply(&self.config.address, original, reply)?;
        let raw = email.formatted();

        self.deliver(email, original.sender()).await?;
        info!(
            to = original.sender(),
            subject = original.subject(),
            "Reply sent"
        );

        self.save_copy(folder, raw).await;
        Ok(())
    }
}
