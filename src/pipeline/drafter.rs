//! Reply drafting: asks the LLM for a support reply, or falls back to a
//! fixed acknowledgement when the model cannot be reached.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::config::{AppConfig, Branding, FolderConfig};
use crate::error::LlmError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::mail::{MailMessage, ReplyContent};

/// Text used in place of a documentation file that cannot be read.
pub const MISSING_DOCUMENTATION: &str = "Documentation file not found.";

const SYSTEM_PROMPT: &str = "You are a helpful customer support agent. Always be professional, \
                             empathetic, and solution-oriented.";

const WRITING_RULES: &str = "\
Please write a helpful and professional response to this customer email. Make sure to:

1. Address their specific questions or concerns.
2. Provide clear and actionable information based on the documentation.
3. Maintain a friendly and professional tone, but don't be condescending or saccharine.
4. Include any relevant links or resources.
5. Take the conversation history into account.
6. Do not use em- or en-dashes. Use normal dashes.
7. Don't sign emails.
8. DO NOT assume things, and DO NOT say you have checked things you haven't. If you don't have \
access to check something, just don't assume or say anything about it. You MUST NEVER make \
implicit assumptions that might be wrong.";

/// Outcome of drafting. Both variants carry a sendable reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Draft {
    /// Written by the model.
    Drafted(ReplyContent),
    /// Static acknowledgement used because the model call failed.
    Fallback(ReplyContent),
}

impl Draft {
    pub fn into_content(self) -> ReplyContent {
        match self {
            Draft::Drafted(c) | Draft::Fallback(c) => c,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Draft::Fallback(_))
    }
}

/// Produces a reply for a message. Never fails: errors become a fallback.
#[async_trait]
pub trait ReplyDrafter: Send + Sync {
    async fn draft(&self, message: &dyn MailMessage, folder: &str) -> Draft;
}

/// `Re:` subject for a reply, without stacking prefixes.
pub fn reply_subject(original: &str) -> String {
    let already_reply = original
        .get(..3)
        .is_some_and(|p| p.eq_ignore_ascii_case("re:"));
    if already_reply {
        original.to_string()
    } else {
        format!("Re: {original}")
    }
}

/// Substitute the branding placeholders in a folder prompt.
pub fn render_prompt(template: &str, branding: &Branding) -> String {
    template
        .replace("{company_name}", &branding.company_name)
        .replace("{support_email}", &branding.support_email)
}

/// The reply sent when drafting fails.
pub fn fallback_reply(message: &dyn MailMessage, branding: &Branding) -> ReplyContent {
    let company = &branding.company_name;
    let body = format!(
        "Dear {sender},\n\
         \n\
         Thank you for contacting {company} support.\n\
         \n\
         We have received your email and are currently experiencing technical difficulties \
         with our automated response system.\n\
         A human support agent will review your message and respond within 24 hours.\n\
         \n\
         We apologize for any inconvenience.\n\
         \n\
         Best regards,\n\
         {company} Support Team\n\
         {support}",
        sender = message.sender(),
        support = branding.support_email,
    );
    ReplyContent {
        subject: reply_subject(message.subject()),
        body,
        html: None,
    }
}

/// Read the reference document for a folder.
async fn load_documentation(path: &Path) -> String {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Documentation file unavailable");
            MISSING_DOCUMENTATION.to_string()
        }
    }
}

/// Drafts replies with an LLM, using per-folder instructions.
pub struct LlmDrafter {
    llm: Arc<dyn LlmProvider>,
    folders: IndexMap<String, FolderConfig>,
    branding: Branding,
}

impl LlmDrafter {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        folders: IndexMap<String, FolderConfig>,
        branding: Branding,
    ) -> Self {
        Self {
            llm,
            folders,
            branding,
        }
    }

    pub fn from_config(llm: Arc<dyn LlmProvider>, config: &AppConfig) -> Self {
        Self::new(llm, config.folders.clone(), config.branding.clone())
    }

    /// Assemble the user prompt for `message` received in `folder`.
    pub async fn build_prompt(&self, message: &dyn MailMessage, folder: &str) -> String {
        let folder_config = self.folders.get(folder).cloned().unwrap_or_default();
        let instructions = render_prompt(&folder_config.prompt, &self.branding);
        let documentation = match &folder_config.documentation_file {
            Some(path) => load_documentation(path).await,
            None => String::new(),
        };

        format!(
            "{instructions}\n\
             \n\
             Documentation:\n\
             {documentation}\n\
             \n\
             Customer Email:\n\
             From: {from}\n\
             Subject: {subject}\n\
             Message:\n\
             ```\n\
             {body}\n\
             ```\n\
             \n\
             {rules}\n",
            from = message.sender(),
            subject = message.subject(),
            body = message.readable_body(),
            rules = WRITING_RULES,
        )
    }

    async fn try_draft(
        &self,
        message: &dyn MailMessage,
        folder: &str,
    ) -> Result<ReplyContent, LlmError> {
        let prompt = self.build_prompt(message, folder).await;
        let request = CompletionRequest::new(vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(prompt),
        ]);

        let response = self.llm.complete(request).await?;
        let body = response.content.trim();
        if body.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.llm.model_name().to_string(),
                reason: "empty completion".into(),
            });
        }

        Ok(ReplyContent {
            subject: reply_subject(message.subject()),
            body: body.to_string(),
            html: None,
        })
    }
}

#[async_trait]
impl ReplyDrafter for LlmDrafter {
    async fn draft(&self, message: &dyn MailMessage, folder: &str) -> Draft {
        match self.try_draft(message, folder).await {
            Ok(content) => {
                debug!(folder, uid = message.uid(), "Reply drafted");
                Draft::Drafted(content)
            }
            Err(e) => {
                warn!(
                    folder,
                    uid = message.uid(),
                    error = %e,
                    "Error generating AI response, using fallback reply"
                );
                Draft::Fallback(fallback_reply(message, &self.branding))
            }
        }
    }
}
