//! LLM integration.
//!
//! Uses the rig-core crate for HTTP transport and the `RigAdapter` to bridge
//! rig's `CompletionModel` trait to our `LlmProvider` trait. A plain
//! `reqwest` call checks at startup that the configured model exists and the
//! key is accepted.

pub mod provider;
mod rig_adapter;

pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::sync::Arc;

use reqwest::StatusCode;
use rig::client::CompletionClient;
use secrecy::ExposeSecret;

use crate::error::LlmError;

const PROVIDER: &str = "openai";

/// Base URL of the OpenAI REST API.
pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: secrecy::SecretString,
    pub model: String,
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("Failed to create OpenAI client: {}", e),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using OpenAI (model: {})", config.model);
    Ok(Arc::new(RigAdapter::new(model, &config.model, PROVIDER)))
}

/// Check that the model exists and the API key is accepted.
pub async fn verify_model(config: &LlmConfig) -> Result<(), LlmError> {
    let url = format!("{OPENAI_API_BASE}/models/{}", config.model);
    let response = reqwest::Client::new()
        .get(&url)
        .bearer_auth(config.api_key.expose_secret())
        .send()
        .await
        .map_err(|e| LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: e.to_string(),
        })?;

    let status = response.status();
    if status.is_success() {
        let body: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| LlmError::InvalidResponse {
                    provider: PROVIDER.to_string(),
                    reason: e.to_string(),
                })?;
        tracing::debug!(model = ?body.get("id"), "Model lookup succeeded");
        return Ok(());
    }
    Err(classify_status(status, &config.model))
}

/// Map a failed model lookup to an error.
fn classify_status(status: StatusCode, model: &str) -> LlmError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::AuthFailed {
            provider: PROVIDER.to_string(),
        },
        StatusCode::NOT_FOUND => LlmError::ModelNotAvailable {
            provider: PROVIDER.to_string(),
            model: model.to_string(),
        },
        other => LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: format!("model lookup returned HTTP {other}"),
        },
    }
}
