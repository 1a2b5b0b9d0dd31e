//! Configuration types.
//!
//! The responder is configured from a single JSON file. Relative paths in
//! it (`state_file`, `documentation_file`, `log_dir`) are resolved against
//! the directory holding that file, so the process can be started from
//! anywhere.

use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;

/// Default IMAP-over-TLS port.
pub const DEFAULT_IMAP_PORT: u16 = 993;

/// Branding used when `company_name` is not configured.
pub const DEFAULT_COMPANY_NAME: &str = "Our Company";

/// Branding used when `support_email` is not configured.
pub const DEFAULT_SUPPORT_EMAIL: &str = "support@company.com";

/// Environment variable consulted when the file has no `openai_api_key`.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Per-folder reply instructions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FolderConfig {
    /// Prompt template; `{company_name}` and `{support_email}` are substituted.
    #[serde(default)]
    pub prompt: String,
    /// Reference text handed to the model. Resolved to an absolute path on load.
    #[serde(default)]
    pub documentation_file: Option<PathBuf>,
}

/// Company details used in prompts and in the fallback reply.
#[derive(Debug, Clone)]
pub struct Branding {
    pub company_name: String,
    pub support_email: String,
}

impl Default for Branding {
    fn default() -> Self {
        Self {
            company_name: DEFAULT_COMPANY_NAME.to_string(),
            support_email: DEFAULT_SUPPORT_EMAIL.to_string(),
        }
    }
}

/// Mail account settings shared by the IMAP scanner and the SMTP sender.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    /// Login for both protocols and the From address of replies.
    pub address: String,
    pub password: SecretString,
}

/// Fully validated application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub email: EmailConfig,
    /// Monitored folders, in the order they appear in the file.
    pub folders: IndexMap<String, FolderConfig>,
    pub model: String,
    pub openai_api_key: SecretString,
    pub branding: Branding,
    pub check_interval: Duration,
    pub state_file: PathBuf,
    pub confirm_before_send: bool,
    pub save_replies: bool,
    pub log_dir: Option<PathBuf>,
}

/// On-disk shape of the configuration file. Required keys are optional here
/// so that a missing one produces a named error instead of a serde message.
#[derive(Debug, Deserialize)]
struct RawConfig {
    imap_server: Option<String>,
    imap_port: Option<u16>,
    email: Option<String>,
    password: Option<String>,
    smtp_server: Option<String>,
    smtp_port: Option<u16>,
    folders: Option<IndexMap<String, FolderConfig>>,
    model: Option<String>,
    openai_api_key: Option<String>,
    company_name: Option<String>,
    support_email: Option<String>,
    check_interval: Option<u64>,
    state_file: Option<PathBuf>,
    #[serde(default = "default_true")]
    confirm_before_send: bool,
    #[serde(default = "default_true")]
    save_replies: bool,
    log_dir: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn require<T>(value: Option<T>, key: &str, hint: &str) -> Result<T, ConfigError> {
    value.ok_or_else(|| ConfigError::MissingRequired {
        key: key.to_string(),
        hint: hint.to_string(),
    })
}

impl AppConfig {
    /// Load and validate the configuration file at `path`.
    ///
    /// The API key falls back to the `OPENAI_API_KEY` environment variable.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        let absolute = std::path::absolute(path)?;
        let config_dir = absolute
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let env_key = std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty());
        Self::from_json(&text, &config_dir, env_key)
    }

    /// Parse configuration text. `config_dir` anchors relative paths.
    pub fn from_json(
        text: &str,
        config_dir: &Path,
        env_api_key: Option<String>,
    ) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_json::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let imap_host = require(raw.imap_server, "imap_server", "Set the IMAP host name.")?;
        let address = require(raw.email, "email", "Set the account email address.")?;
        let password = require(raw.password, "password", "Set the account password.")?;
        let smtp_host = require(raw.smtp_server, "smtp_server", "Set the SMTP host name.")?;
        let smtp_port = require(raw.smtp_port, "smtp_port", "Usually 587 (STARTTLS) or 465.")?;
        let folders = require(
            raw.folders,
            "folders",
            "Add at least one folder to monitor.",
        )?;
        let model = require(raw.model, "model", "Set the model used to draft replies.")?;
        let openai_api_key = require(
            raw.openai_api_key.filter(|k| !k.is_empty()).or(env_api_key),
            "openai_api_key",
            "Please add your OpenAI API key to the config file or export OPENAI_API_KEY.",
        )?;
        let check_interval = require(
            raw.check_interval,
            "check_interval",
            "Set the number of seconds between checks.",
        )?;
        let state_file = require(
            raw.state_file,
            "state_file",
            "Set the path of the processed-message state file.",
        )?;

        if folders.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "folders".into(),
                message: "at least one folder is required".into(),
            });
        }
        // Mailbox names go on the wire as-is; non-ASCII ones need the
        // server's modified UTF-7 spelling (e.g. `Entw&APw-rfe`).
        if let Some(name) = folders.keys().find(|name| !name.is_ascii()) {
            return Err(ConfigError::InvalidValue {
                key: "folders".into(),
                message: format!(
                    "folder name '{name}' is not ASCII; use its IMAP modified UTF-7 name"
                ),
            });
        }
        if check_interval == 0 {
            return Err(ConfigError::InvalidValue {
                key: "check_interval".into(),
                message: "must be greater than zero".into(),
            });
        }

        let folders = folders
            .into_iter()
            .map(|(name, mut folder)| {
                folder.documentation_file = folder
                    .documentation_file
                    .map(|p| config_dir.join(p));
                (name, folder)
            })
            .collect();

        let defaults = Branding::default();
        let branding = Branding {
            company_name: raw.company_name.unwrap_or(defaults.company_name),
            support_email: raw.support_email.unwrap_or(defaults.support_email),
        };

        Ok(Self {
            email: EmailConfig {
                imap_host,
                imap_port: raw.imap_port.unwrap_or(DEFAULT_IMAP_PORT),
                smtp_host,
                smtp_port,
                address,
                password: SecretString::from(password),
            },
            folders,
            model,
            openai_api_key: SecretString::from(openai_api_key),
            branding,
            check_interval: Duration::from_secs(check_interval),
            state_file: config_dir.join(state_file),
            confirm_before_send: raw.confirm_before_send,
            save_replies: raw.save_replies,
            log_dir: raw.log_dir.map(|p| config_dir.join(p)),
        })
    }

    /// Folder names in configuration order.
    pub fn folder_names(&self) -> Vec<String> {
        self.folders.keys().cloned().collect()
    }
}
