use crate::config::Settings;
use crate::llm::error::LlmDiagnosticsError;
use crate::llm::{ExtractionPrompt, LlmClient, LlmResponse, Provider};
use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-3-5-sonnet-latest";
const DEFAULT_MAX_TOKENS: u32 = 2048;
const DEFAULT_TIMEOUT_SECS: u64 = 60;

const TOOL_NAME_EMIT_RECOMMENDATIONS: &str = "emit_recommendations";

#[derive(Debug, Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicClient {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let api_key = settings.require_anthropic_api_key()?.to_string();
        let base_url =
            std::env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let model = std::env::var("ANTHROPIC_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let max_tokens = std::env::var("ANTHROPIC_MAX_TOKENS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_MAX_TOKENS);

        let timeout_secs = std::env::var("ANTHROPIC_TIMEOUT_SECS")
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
            max_tokens,
        })
    }

    async fn create_message(
        &self,
        req: CreateMessageRequest,
    ) -> anyhow::Result<(String, CreateMessageResponse)> {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_str(&self.api_key)?);
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );

        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let res = self
            .http
            .post(url)
            .headers(headers)
            .json(&req)
            .send()
            .await
            .map_err(|e| LlmDiagnosticsError::from_transport(Provider::Anthropic, e))?;

        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|e| LlmDiagnosticsError::from_transport(Provider::Anthropic, e))?;
        if !status.is_success() {
            return Err(LlmDiagnosticsError::from_status(Provider::Anthropic, status, text).into());
        }

        let parsed = serde_json::from_str::<CreateMessageResponse>(&text).map_err(|e| {
            LlmDiagnosticsError {
                provider: Provider::Anthropic,
                stage: "decode_response",
                detail: e.to_string(),
                raw_output: Some(text.clone()),
                raw_response_json: None,
                retryable: false,
            }
        })?;
        Ok((text, parsed))
    }

    fn tools(schema: &serde_json::Value) -> Vec<Tool> {
        vec![Tool {
            name: TOOL_NAME_EMIT_RECOMMENDATIONS,
            description: "Emit the stock recommendations explicitly stated in the article",
            input_schema: schema.clone(),
        }]
    }

    fn tool_choice() -> ToolChoice {
        ToolChoice::Tool {
            name: TOOL_NAME_EMIT_RECOMMENDATIONS,
        }
    }

    fn response_text(res: &CreateMessageResponse) -> String {
        let mut out = String::new();
        for block in &res.content {
            if let ContentBlock::Text { text } = block {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }

    fn response_tool_input(res: &CreateMessageResponse) -> Option<serde_json::Value> {
        res.content.iter().find_map(|block| match block {
            ContentBlock::ToolUse { name, input, .. } if name == TOOL_NAME_EMIT_RECOMMENDATIONS => {
                Some(input.clone())
            }
            _ => None,
        })
    }
}

#[async_trait::async_trait]
impl LlmClient for AnthropicClient {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    async fn extract(
        &self,
        prompt: &ExtractionPrompt,
        schema: &serde_json::Value,
    ) -> anyhow::Result<LlmResponse> {
        let make_req = |max_tokens: u32| CreateMessageRequest {
            model: self.model.clone(),
            max_tokens,
            system: Some(prompt.system.clone()),
            messages: vec![Message {
                role: "user",
                content: prompt.user.clone(),
            }],
            tools: Some(Self::tools(schema)),
            tool_choice: Some(Self::tool_choice()),
        };

        let (mut raw, mut res) = self.create_message(make_req(self.max_tokens)).await?;

        // A truncated tool call is unusable; retry once with a higher ceiling.
        if matches!(res.stop_reason.as_deref(), Some("max_tokens")) {
            let bumped = self.max_tokens.saturating_mul(2).max(4096);
            tracing::warn!(
                from = self.max_tokens,
                to = bumped,
                "Anthropic stop_reason=max_tokens; retrying once with higher max_tokens"
            );
            let (r2, p2) = self.create_message(make_req(bumped)).await?;
            raw = r2;
            res = p2;
        }

        Ok(LlmResponse {
            structured: Self::response_tool_input(&res),
            text: Self::response_text(&res),
            raw_output: raw,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
struct CreateMessageRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<Message>,

    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ToolChoice>,
}

#[derive(Debug, Clone, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CreateMessageResponse {
    content: Vec<ContentBlock>,

    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct Tool {
    name: &'static str,
    description: &'static str,
    input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
enum ToolChoice {
    #[serde(rename = "tool")]
    Tool { name: &'static str },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        #[serde(default)]
        id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },

    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::json::{extraction_schema, parse_extraction};
    use serde_json::json;

    #[test]
    fn reads_tool_use_input_over_text() {
        let body = json!({
            "content": [
                {"type": "thinking", "thinking": "...", "signature": "x"},
                {"type": "text", "text": "Here you go."},
                {
                    "type": "tool_use",
                    "id": "toolu_1",
                    "name": TOOL_NAME_EMIT_RECOMMENDATIONS,
                    "input": {"analysis_date": null, "recommendations": []}
                }
            ],
            "stop_reason": "tool_use"
        });
        let res: CreateMessageResponse = serde_json::from_value(body).unwrap();
        let out = LlmResponse {
            raw_output: String::new(),
            structured: AnthropicClient::response_tool_input(&res),
            text: AnthropicClient::response_text(&res),
        };
        assert_eq!(out.text, "Here you go.");
        let parsed = parse_extraction(&out).unwrap();
        assert!(parsed.recommendations.is_empty());
    }

    #[test]
    fn request_forces_the_extraction_tool() {
        let schema = extraction_schema();
        let req = CreateMessageRequest {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            system: Some("sys".to_string()),
            messages: vec![Message {
                role: "user",
                content: "page".to_string(),
            }],
            tools: Some(AnthropicClient::tools(&schema)),
            tool_choice: Some(AnthropicClient::tool_choice()),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["tool_choice"]["type"], "tool");
        assert_eq!(v["tool_choice"]["name"], TOOL_NAME_EMIT_RECOMMENDATIONS);
        assert_eq!(v["tools"][0]["input_schema"], schema);
    }
}
