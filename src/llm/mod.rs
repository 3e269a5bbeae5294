//! LLM integration for coach-core.
//!
//! Supports:
//! - **Anthropic**: Direct API access via rig-core
//! - **OpenAI**: Direct API access via rig-core
//!
//! rig-core handles HTTP transport; [`RigAdapter`] bridges its
//! `CompletionModel` trait to our [`LlmProvider`]. Providers are combined
//! into a [`FailoverProvider`] in configured priority order. Vision calls
//! use the same trait; images ride on [`ChatMessage`].

mod costs;
pub mod failover;
pub mod json;
pub mod provider;
mod rig_adapter;

pub use failover::FailoverProvider;
pub use json::extract_json_object;
pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rig::client::CompletionClient;
use secrecy::ExposeSecret;

use crate::error::LlmError;

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

impl FromStr for LlmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" | "gpt" => Ok(Self::OpenAi),
            other => Err(format!("unknown LLM backend: {other}")),
        }
    }
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: secrecy::SecretString,
    pub model: String,
}

/// Create a single provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.backend {
        LlmBackend::Anthropic => create_anthropic_provider(config),
        LlmBackend::OpenAi => create_openai_provider(config),
    }
}

fn create_anthropic_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {e}"),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(Arc::new(RigAdapter::new("anthropic", model, &config.model)))
}

fn create_openai_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "openai".to_string(),
                reason: format!("Failed to create OpenAI client: {e}"),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using OpenAI (model: {})", config.model);
    Ok(Arc::new(RigAdapter::new("openai", model, &config.model)))
}

/// Build the ordered fallback chain used by every handler.
///
/// A provider whose client cannot be built is logged and left out.
pub fn create_provider_chain(configs: &[LlmConfig], default_timeout: Duration) -> Arc<dyn LlmProvider> {
    let providers = configs
        .iter()
        .filter_map(|config| match create_provider(config) {
            Ok(provider) => Some(provider),
            Err(e) => {
                tracing::warn!(model = %config.model, error = %e, "Skipping LLM provider");
                None
            }
        })
        .collect::<Vec<_>>();
    if providers.is_empty() {
        tracing::warn!("No LLM providers configured; every call will use canned fallbacks");
    }
    Arc::new(FailoverProvider::new(providers, default_timeout))
}
