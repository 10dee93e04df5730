//! Page text -> model call -> strict contract -> candidates.

use crate::domain::contract::ExtractionContext;
use crate::domain::page::{ParseStatus, RawExtraction, ScrapedPage};
use crate::domain::recommendation::Candidate;
use crate::llm::error::ParseError;
use crate::llm::json::{extraction_schema, parse_extraction};
use crate::llm::{ExtractionPrompt, LlmClient};
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Text beyond this many characters is not sent to the model.
pub const MAX_PROMPT_CHARS: usize = 10_000;

/// One extraction call: the audit record plus the parsed candidates, or the
/// reason the reply was unusable.
#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    pub raw: RawExtraction,
    pub candidates: Result<Vec<Candidate>, ParseError>,
}

#[derive(Clone)]
pub struct ExtractionEngine {
    client: Arc<dyn LlmClient>,
    schema: serde_json::Value,
    max_chars: usize,
}

impl ExtractionEngine {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            schema: extraction_schema(),
            max_chars: MAX_PROMPT_CHARS,
        }
    }

    /// Transport failures come back as `Err` so the caller can retry them;
    /// a reply that breaks the contract is a completed call with a `ParseError`.
    pub async fn extract(
        &self,
        run_id: Uuid,
        page: &ScrapedPage,
        fallback_date: Option<NaiveDate>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ExtractionOutcome> {
        let prompt = build_prompt(page, self.max_chars);
        let res = self.client.extract(&prompt, &self.schema).await?;

        let ctx = ExtractionContext {
            source_url: page.url.clone(),
            fallback_date: page.published.or(fallback_date),
            extracted_at: now,
        };
        let candidates = parse_extraction(&res).and_then(|parsed| parsed.into_candidates(&ctx));

        let parse_status = match &candidates {
            Ok(c) => ParseStatus::Parsed {
                candidates: c.len(),
            },
            Err(e) => ParseStatus::Failed {
                reason: e.to_string(),
            },
        };

        Ok(ExtractionOutcome {
            raw: RawExtraction {
                id: Uuid::new_v4(),
                run_id,
                page_url: page.url.clone(),
                provider: self.client.provider().as_str().to_string(),
                raw_output: res.raw_output,
                parse_status,
                created_at: now,
            },
            candidates,
        })
    }
}

pub fn build_prompt(page: &ScrapedPage, max_chars: usize) -> ExtractionPrompt {
    let system = [
        "You extract stock recommendations from a single financial article.",
        "Rules:",
        "- Only report stocks the article explicitly recommends or rates. A ticker that is merely mentioned is not a recommendation.",
        "- Only fill a field when its value is written in the text. Never infer, estimate or compute missing numbers; use null.",
        "- rating: a number on a 0-5 scale only when the article states one (e.g. a star count). Otherwise null.",
        "- rating_label: the rating wording exactly as written (Strong Buy, Buy, Hold, Sell, Strong Sell, or a star run), or null.",
        "- Prices are plain numbers in the quoted currency, without symbols.",
        "- analysis_date: the article's date as YYYY-MM-DD when stated, else null.",
        "- source_span: copy the sentence the recommendation was read from.",
        "- reasoning: a short summary of the article's stated reasons, max 500 characters.",
        "- If the article contains no recommendation, return an empty recommendations list. Do not guess.",
    ]
    .join("\n");

    let published = page
        .published
        .map(|d| d.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let user = format!(
        "URL: {}\nTitle: {}\nPublished: {}\n\nContent:\n{}",
        page.url,
        page.title,
        published,
        truncate_chars(&page.text, max_chars)
    );

    ExtractionPrompt { system, user }
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmResponse, Provider};
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Mutex;

    struct ScriptedLlm {
        reply: LlmResponse,
        last_prompt: Mutex<Option<ExtractionPrompt>>,
    }

    #[async_trait::async_trait]
    impl LlmClient for ScriptedLlm {
        fn provider(&self) -> Provider {
            Provider::Anthropic
        }

        async fn extract(
            &self,
            prompt: &ExtractionPrompt,
            _schema: &serde_json::Value,
        ) -> anyhow::Result<LlmResponse> {
            *self.last_prompt.lock().unwrap() = Some(prompt.clone());
            Ok(self.reply.clone())
        }
    }

    fn page(text: &str) -> ScrapedPage {
        ScrapedPage {
            url: "https://example.com/picks".to_string(),
            title: "Picks".to_string(),
            text: text.to_string(),
            content_hash: "h".to_string(),
            published: None,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 11, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn parses_structured_reply_into_candidates() {
        let payload = json!({
            "analysis_date": "2025-01-10",
            "recommendations": [{
                "ticker": "AAPL", "exchange": "NASDAQ", "company_name": "Apple",
                "rating": null, "rating_label": "Strong Buy", "price": null,
                "fair_price": 210, "target_price": 225, "growth_forecast_pct": null,
                "pe": null, "reasoning": "Services growth", "analyst": null,
                "source_span": "Apple (AAPL, NASDAQ): Strong Buy"
            }]
        });
        let llm = Arc::new(ScriptedLlm {
            reply: LlmResponse {
                raw_output: payload.to_string(),
                structured: Some(payload),
                text: String::new(),
            },
            last_prompt: Mutex::new(None),
        });
        let engine = ExtractionEngine::new(llm.clone());
        let out = engine
            .extract(Uuid::nil(), &page("Apple (AAPL, NASDAQ): Strong Buy"), None, now())
            .await
            .unwrap();

        let candidates = out.candidates.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].rating, Some(5.0));
        assert_eq!(out.raw.parse_status, ParseStatus::Parsed { candidates: 1 });
        assert_eq!(out.raw.provider, "anthropic");

        let prompt = llm.last_prompt.lock().unwrap().clone().unwrap();
        assert!(prompt.system.contains("empty recommendations list"));
        assert!(prompt.user.contains("Published: unknown"));
    }

    #[tokio::test]
    async fn malformed_reply_is_reported_not_raised() {
        let llm = Arc::new(ScriptedLlm {
            reply: LlmResponse {
                raw_output: "Sorry, I can't help.".to_string(),
                structured: None,
                text: "Sorry, I can't help.".to_string(),
            },
            last_prompt: Mutex::new(None),
        });
        let out = ExtractionEngine::new(llm)
            .extract(Uuid::nil(), &page("text"), None, now())
            .await
            .unwrap();
        assert_eq!(out.candidates, Err(ParseError::NoPayload));
        assert_eq!(out.raw.raw_output, "Sorry, I can't help.");
        assert!(matches!(out.raw.parse_status, ParseStatus::Failed { .. }));
    }

    #[test]
    fn truncates_on_char_boundary() {
        let text = "é".repeat(12_000);
        let prompt = build_prompt(&page(&text), MAX_PROMPT_CHARS);
        let content = prompt.user.split("Content:\n").nth(1).unwrap();
        assert_eq!(content.chars().count(), MAX_PROMPT_CHARS);
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
