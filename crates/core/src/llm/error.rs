use crate::llm::Provider;
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone)]
pub struct LlmDiagnosticsError {
    pub provider: Provider,
    pub stage: &'static str,
    pub detail: String,
    pub raw_output: Option<String>,
    pub raw_response_json: Option<Value>,
    /// Timeouts, rate limits and 5xx; a later attempt may succeed.
    pub retryable: bool,
}

impl fmt::Display for LlmDiagnosticsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LLM error (provider={}, stage={}, retryable={}): {}",
            self.provider.as_str(),
            self.stage,
            self.retryable,
            self.detail
        )
    }
}

impl std::error::Error for LlmDiagnosticsError {}

impl LlmDiagnosticsError {
    pub fn from_transport(provider: Provider, err: reqwest::Error) -> Self {
        let stage = if err.is_timeout() { "timeout" } else { "transport" };
        Self {
            provider,
            stage,
            retryable: err.is_timeout() || err.is_connect() || err.is_request(),
            detail: err.to_string(),
            raw_output: None,
            raw_response_json: None,
        }
    }

    pub fn from_status(provider: Provider, status: reqwest::StatusCode, body: String) -> Self {
        let raw_response_json = serde_json::from_str::<Value>(&body).ok();
        Self {
            provider,
            stage: "http",
            retryable: status.as_u16() == 429 || status.as_u16() == 529 || status.is_server_error(),
            detail: format!("status={status}"),
            raw_output: Some(body),
            raw_response_json,
        }
    }
}

/// Whether an extraction-call failure is worth another attempt.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    if let Some(diag) = err.downcast_ref::<LlmDiagnosticsError>() {
        return diag.retryable;
    }
    if let Some(req) = err.downcast_ref::<reqwest::Error>() {
        return req.is_timeout() || req.is_connect();
    }
    false
}

/// The model answered, but not with the extraction contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// No tool call and no JSON object anywhere in the reply.
    NoPayload,
    NotJson(String),
    /// Valid JSON that violates the contract (missing key, wrong type, bad date).
    Schema(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::NoPayload => f.write_str("model reply contained no JSON payload"),
            ParseError::NotJson(e) => write!(f, "model reply is not valid JSON: {e}"),
            ParseError::Schema(e) => write!(f, "model reply violates extraction schema: {e}"),
        }
    }
}

impl std::error::Error for ParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_flag_survives_anyhow() {
        let err: anyhow::Error = LlmDiagnosticsError::from_status(
            Provider::Anthropic,
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            "{}".to_string(),
        )
        .into();
        assert!(is_retryable(&err));

        let err: anyhow::Error = LlmDiagnosticsError::from_status(
            Provider::OpenAI,
            reqwest::StatusCode::BAD_REQUEST,
            "bad".to_string(),
        )
        .into();
        assert!(!is_retryable(&err));
        assert!(!is_retryable(&anyhow::anyhow!("plain")));
    }
}
