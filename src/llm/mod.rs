//! Language model integration.
//!
//! The execution step only sees [`LlmProvider`]; the Anthropic Messages API
//! is the one backend wired up by default.

mod anthropic;
pub mod provider;

pub use anthropic::{AnthropicProvider, DEFAULT_BASE_URL};
pub use provider::*;

use std::sync::Arc;

use crate::error::LlmError;

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: secrecy::SecretString,
    pub model: String,
    pub base_url: String,
    /// Per-response token ceiling.
    pub max_tokens: u32,
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let provider = AnthropicProvider::new(
        config.api_key.clone(),
        &config.model,
        &config.base_url,
        config.max_tokens,
    )?;
    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(Arc::new(provider))
}
