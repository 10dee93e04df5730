use crate::config::Settings;
use crate::llm::error::LlmDiagnosticsError;
use crate::llm::{ExtractionPrompt, LlmClient, LlmResponse, Provider};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const SCHEMA_NAME: &str = "stock_recommendations";

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiClient {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let api_key = settings.require_openai_api_key()?.to_string();
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let timeout_secs = std::env::var("OPENAI_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build reqwest client")?;

        Ok(Self {
            http,
            api_key,
            base_url,
            model,
        })
    }

    fn build_request(&self, prompt: &ExtractionPrompt, schema: &serde_json::Value) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            temperature: 0.0,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: prompt.system.clone(),
                },
                ChatMessage {
                    role: "user",
                    content: prompt.user.clone(),
                },
            ],
            response_format: serde_json::json!({
                "type": "json_schema",
                "json_schema": {
                    "name": SCHEMA_NAME,
                    "strict": true,
                    "schema": schema,
                }
            }),
        }
    }

    fn response_content(res: &ChatResponse) -> Option<&str> {
        res.choices
            .first()
            .and_then(|c| c.message.content.as_deref())
    }
}

#[async_trait::async_trait]
impl LlmClient for OpenAiClient {
    fn provider(&self) -> Provider {
        Provider::OpenAI
    }

    async fn extract(
        &self,
        prompt: &ExtractionPrompt,
        schema: &serde_json::Value,
    ) -> anyhow::Result<LlmResponse> {
        let url = format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        );
        let res = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&self.build_request(prompt, schema))
            .send()
            .await
            .map_err(|e| LlmDiagnosticsError::from_transport(Provider::OpenAI, e))?;

        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|e| LlmDiagnosticsError::from_transport(Provider::OpenAI, e))?;
        if !status.is_success() {
            return Err(LlmDiagnosticsError::from_status(Provider::OpenAI, status, text).into());
        }

        let parsed = serde_json::from_str::<ChatResponse>(&text).map_err(|e| {
            LlmDiagnosticsError {
                provider: Provider::OpenAI,
                stage: "decode_response",
                detail: e.to_string(),
                raw_output: Some(text.clone()),
                raw_response_json: None,
                retryable: false,
            }
        })?;

        // Strict mode returns the object as a JSON string in `content`.
        let content = Self::response_content(&parsed).unwrap_or_default().to_string();
        let structured = serde_json::from_str::<serde_json::Value>(&content)
            .ok()
            .filter(|v| v.is_object());

        Ok(LlmResponse {
            raw_output: text,
            structured,
            text: content,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    temperature: f32,
    messages: Vec<ChatMessage>,
    response_format: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}
