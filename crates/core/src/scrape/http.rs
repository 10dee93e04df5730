use crate::config::{env_or, Settings};
use crate::scrape::{BackendError, RawDocument, ScraperBackend};
use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RENDER_TIMEOUT_SECS: u64 = 60;
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Buttons the renderer tries, in order, to dismiss cookie/consent overlays.
pub const CONSENT_SELECTORS: &[&str] = &[
    r#"button:has-text("Alle akzeptieren")"#,
    r#"button:has-text("Accept all")"#,
    r#"button:has-text("Accept All")"#,
    r#"button:has-text("I Accept")"#,
    r#"button:has-text("I agree")"#,
    r#"button:has-text("Agree")"#,
    r#"button:has-text("Alle ablehnen")"#,
    r#"button:has-text("Reject all")"#,
    r#"[class*="accept"][class*="cookie"]"#,
    r#"[class*="consent"][class*="accept"]"#,
    r#"[id*="accept"][id*="cookie"]"#,
];

fn status_error(status: u16) -> Option<BackendError> {
    match status {
        200..=299 => None,
        404 | 410 => Some(BackendError::NotFound),
        500..=599 => Some(BackendError::Transport(format!("status={status}"))),
        s => Some(BackendError::Blocked(s)),
    }
}

fn transport_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Transport(e.to_string())
    }
}

/// Plain GET with browser-like headers.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    http: reqwest::Client,
}

impl HttpBackend {
    pub fn from_env() -> anyhow::Result<Self> {
        let timeout_secs = env_or("SCRAPER_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS);
        let user_agent =
            std::env::var("SCRAPER_USER_AGENT").unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string());

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&user_agent).context("invalid SCRAPER_USER_AGENT")?,
        );
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self { http })
    }
}

#[async_trait::async_trait]
impl ScraperBackend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch(&self, url: &str) -> Result<RawDocument, BackendError> {
        let res = self.http.get(url).send().await.map_err(transport_error)?;
        if let Some(err) = status_error(res.status().as_u16()) {
            return Err(err);
        }

        let final_url = res.url().to_string();
        let content_type = res
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = res.bytes().await.map_err(transport_error)?;

        Ok(RawDocument {
            final_url,
            content_type,
            body: body.to_vec(),
        })
    }
}

/// Headless-browser rendering service for JS-heavy pages and bot walls.
///
/// Protocol: `POST {RENDER_SERVICE_URL}` with `RenderRequest`, answered by
/// `RenderResponse` carrying the upstream status and the rendered HTML.
#[derive(Debug, Clone)]
pub struct RenderServiceBackend {
    http: reqwest::Client,
    endpoint: String,
    wait_ms: u64,
}

impl RenderServiceBackend {
    /// `None` when no render service is configured.
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Option<Self>> {
        let Some(endpoint) = settings.render_service_url.clone() else {
            return Ok(None);
        };
        let timeout_secs = env_or("RENDER_TIMEOUT_SECS", DEFAULT_RENDER_TIMEOUT_SECS);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build reqwest client")?;
        Ok(Some(Self {
            http,
            endpoint,
            wait_ms: env_or("RENDER_WAIT_MS", 5000),
        }))
    }

    fn request<'a>(&self, url: &'a str) -> RenderRequest<'a> {
        RenderRequest {
            url,
            wait_until: "networkidle",
            wait_ms: self.wait_ms,
            consent_selectors: CONSENT_SELECTORS,
        }
    }
}

#[async_trait::async_trait]
impl ScraperBackend for RenderServiceBackend {
    fn name(&self) -> &'static str {
        "render"
    }

    async fn fetch(&self, url: &str) -> Result<RawDocument, BackendError> {
        let res = self
            .http
            .post(&self.endpoint)
            .json(&self.request(url))
            .send()
            .await
            .map_err(transport_error)?;
        let status = res.status();
        if !status.is_success() {
            return Err(BackendError::Transport(format!(
                "render service status={status}"
            )));
        }

        let body = res.text().await.map_err(transport_error)?;
        let parsed = serde_json::from_str::<RenderResponse>(&body)
            .map_err(|e| BackendError::Transport(format!("bad render response: {e}")))?;
        if let Some(err) = status_error(parsed.status) {
            return Err(err);
        }

        Ok(RawDocument {
            final_url: parsed.final_url.unwrap_or_else(|| url.to_string()),
            content_type: Some("text/html; charset=utf-8".to_string()),
            body: parsed.html.into_bytes(),
        })
    }
}

#[derive(Debug, Serialize)]
struct RenderRequest<'a> {
    url: &'a str,
    wait_until: &'static str,
    wait_ms: u64,
    consent_selectors: &'static [&'static str],
}

#[derive(Debug, Deserialize)]
struct RenderResponse {
    status: u16,
    #[serde(default)]
    html: String,
    #[serde(default)]
    final_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_statuses() {
        assert_eq!(status_error(200), None);
        assert_eq!(status_error(404), Some(BackendError::NotFound));
        assert_eq!(status_error(403), Some(BackendError::Blocked(403)));
        assert_eq!(status_error(429), Some(BackendError::Blocked(429)));
        assert!(matches!(status_error(503), Some(BackendError::Transport(_))));
    }

    #[test]
    fn render_request_carries_consent_selectors() {
        let backend = RenderServiceBackend {
            http: reqwest::Client::new(),
            endpoint: "http://render.local/render".to_string(),
            wait_ms: 5000,
        };
        let v = serde_json::to_value(backend.request("https://www.morningstar.com/x")).unwrap();
        assert_eq!(v["url"], "https://www.morningstar.com/x");
        assert_eq!(v["consent_selectors"][1], json!(r#"button:has-text("Accept all")"#));
    }

    #[test]
    fn render_response_defaults() {
        let r: RenderResponse = serde_json::from_value(json!({"status": 403})).unwrap();
        assert_eq!(r.html, "");
        assert_eq!(status_error(r.status), Some(BackendError::Blocked(403)));
    }
}
