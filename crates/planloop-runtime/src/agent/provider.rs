//! LLM completion capability.
//!
//! Concrete provider drivers live outside this crate; the executor only sees
//! [`CompletionProvider`]. [`FallbackProvider`] chains several of them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::types::{Message, ProviderResponse, ToolDefinition};

/// Errors a provider can report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Provider timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("No provider available")]
    Unavailable,
}

impl ProviderError {
    /// Whether another provider might succeed where this one failed.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Timeout(_) | Self::Transport(_)
        )
    }
}

/// Sampling parameters passed through to the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Something that turns a conversation into the model's next step.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider name, for logs.
    fn name(&self) -> &str;

    /// Produce either a final answer or a batch of tool calls.
    async fn generate(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        config: &GenerationConfig,
    ) -> Result<ProviderResponse, ProviderError>;
}

/// Tries providers in order, moving on only after a retryable error.
pub struct FallbackProvider {
    name: String,
    candidates: Vec<Arc<dyn CompletionProvider>>,
}

impl FallbackProvider {
    pub fn new(candidates: Vec<Arc<dyn CompletionProvider>>) -> Self {
        let name = candidates
            .iter()
            .map(|p| p.name())
            .collect::<Vec<_>>()
            .join("->");
        Self {
            name: format!("fallback({name})"),
            candidates,
        }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

#[async_trait]
impl CompletionProvider for FallbackProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        config: &GenerationConfig,
    ) -> Result<ProviderResponse, ProviderError> {
        let mut last_error = ProviderError::Unavailable;

        for provider in &self.candidates {
            match provider.generate(messages, tools, config).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => {
                    warn!(provider = provider.name(), error = %e, "Provider failed, trying next");
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }
}
