//! Send-mode policy: send straight away, or ask an operator first.

use std::io::{BufRead, Write};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::MailError;
use crate::mail::{MailMessage, ReplyContent};

const RULE: &str = "============================================================";
const THIN_RULE: &str = "------------------------------------------------------------";

/// What to do with a drafted reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Send,
    /// Do not send. The message still counts as handled.
    Skip,
}

/// Decides whether a drafted reply goes out.
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(
        &self,
        original: &dyn MailMessage,
        reply: &ReplyContent,
        from: &str,
    ) -> Result<Decision, MailError>;
}

/// Sends every reply without asking.
pub struct AutoApprove;

#[async_trait]
impl Confirmer for AutoApprove {
    async fn confirm(
        &self,
        _original: &dyn MailMessage,
        _reply: &ReplyContent,
        _from: &str,
    ) -> Result<Decision, MailError> {
        Ok(Decision::Send)
    }
}

/// Read `input` line by line on a detached thread, never on the runtime's
/// blocking pool. The thread ends at end of input or once the receiver is
/// dropped.
fn spawn_line_reader<R>(input: R) -> mpsc::Receiver<String>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);
    std::thread::spawn(move || {
        for line in input.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    debug!("Confirmation input failed: {e}");
                    break;
                }
            };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Shows each reply and waits for `y` or `n` on a line-oriented input.
pub struct PromptConfirmer<W> {
    input: tokio::sync::Mutex<mpsc::Receiver<String>>,
    output: std::sync::Mutex<W>,
}

/// Confirmation on the controlling terminal.
pub type TerminalConfirmer = PromptConfirmer<std::io::Stdout>;

impl TerminalConfirmer {
    pub fn terminal() -> Self {
        Self::new(std::io::BufReader::new(std::io::stdin()), std::io::stdout())
    }
}

impl<W: Write + Send> PromptConfirmer<W> {
    pub fn new<R>(input: R, output: W) -> Self
    where
        R: BufRead + Send + 'static,
    {
        Self {
            input: tokio::sync::Mutex::new(spawn_line_reader(input)),
            output: std::sync::Mutex::new(output),
        }
    }

    fn say(&self, text: &str) -> Result<(), MailError> {
        let mut out = self
            .output
            .lock()
            .map_err(|_| MailError::Task("confirmation output poisoned".into()))?;
        out.write_all(text.as_bytes())?;
        out.flush()?;
        Ok(())
    }
}

/// The preview shown before asking.
pub fn render_preview(original: &dyn MailMessage, reply: &ReplyContent, from: &str) -> String {
    format!(
        "\n{RULE}\nPROPOSED EMAIL RESPONSE:\n{RULE}\n\
         To: {to}\n\
         From: {from}\n\
         Subject: {subject}\n\
         {THIN_RULE}\n\
         Body:\n\
         {body}\n\
         {RULE}\n",
        to = original.sender(),
        subject = reply.subject,
        body = reply.body,
    )
}

#[async_trait]
impl<W: Write + Send> Confirmer for PromptConfirmer<W> {
    async fn confirm(
        &self,
        original: &dyn MailMessage,
        reply: &ReplyContent,
        from: &str,
    ) -> Result<Decision, MailError> {
        self.say(&render_preview(original, reply, from))?;

        let mut input = self.input.lock().await;
        loop {
            self.say("\nSend this email? (y/n): ")?;
            let Some(line) = input.recv().await else {
                return Err(MailError::InputClosed);
            };
            match line.trim().to_lowercase().as_str() {
                "y" => {
                    self.say("Sending...\n")?;
                    return Ok(Decision::Send);
                }
                "n" => {
                    self.say("Email cancelled.\n")?;
                    return Ok(Decision::Skip);
                }
                _ => self.say("Please enter 'y' or 'n'.\n")?,
            }
        }
    }
}
