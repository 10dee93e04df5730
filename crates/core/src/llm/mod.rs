pub mod anthropic;
pub mod error;
pub mod json;
pub mod openai;

use crate::config::Settings;
use std::sync::Arc;

/// Prompt pair for one extraction call; the schema travels separately.
#[derive(Debug, Clone)]
pub struct ExtractionPrompt {
    pub system: String,
    pub user: String,
}

/// What came back from the provider, before contract parsing.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// Full provider reply body, kept verbatim for the audit trail.
    pub raw_output: String,
    /// Structured payload when the provider returned one (tool input, strict JSON mode).
    pub structured: Option<serde_json::Value>,
    /// Concatenated text blocks, used when no structured payload exists.
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    OpenAI,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::OpenAI => "openai",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Some(Provider::Anthropic),
            "openai" | "gpt" => Some(Provider::OpenAI),
            _ => None,
        }
    }
}

#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    fn provider(&self) -> Provider;

    /// One schema-constrained completion. Transport and HTTP failures are
    /// `Err` (see `error::is_retryable`); contract checks happen in the caller.
    async fn extract(
        &self,
        prompt: &ExtractionPrompt,
        schema: &serde_json::Value,
    ) -> anyhow::Result<LlmResponse>;
}

/// Builds the configured provider; `LLM_PROVIDER` defaults to Anthropic.
pub fn client_from_settings(settings: &Settings) -> anyhow::Result<Arc<dyn LlmClient>> {
    let provider = match settings.llm_provider.as_deref() {
        Some(raw) => Provider::parse(raw)
            .ok_or_else(|| anyhow::anyhow!("unknown LLM_PROVIDER: {raw}"))?,
        None => Provider::Anthropic,
    };
    Ok(match provider {
        Provider::Anthropic => Arc::new(anthropic::AnthropicClient::from_settings(settings)?),
        Provider::OpenAI => Arc::new(openai::OpenAiClient::from_settings(settings)?),
    })
}
