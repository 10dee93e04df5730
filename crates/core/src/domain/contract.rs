//! Strict wire contract for the model's extraction output.
//!
//! Every key must be present (nullable keys may be `null`), unknown keys are
//! rejected, and numbers must be JSON numbers. Anything else is a `ParseError`.

use crate::domain::recommendation::Candidate;
use crate::llm::error::ParseError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmExtraction {
    #[serde(deserialize_with = "nullable")]
    pub analysis_date: Option<String>,
    pub recommendations: Vec<LlmCandidate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmCandidate {
    pub ticker: String,
    #[serde(deserialize_with = "nullable")]
    pub exchange: Option<String>,
    #[serde(deserialize_with = "nullable")]
    pub company_name: Option<String>,
    #[serde(deserialize_with = "nullable")]
    pub rating: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    pub rating_label: Option<String>,
    #[serde(deserialize_with = "nullable")]
    pub price: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    pub fair_price: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    pub target_price: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    pub growth_forecast_pct: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    pub pe: Option<f64>,
    pub reasoning: String,
    #[serde(deserialize_with = "nullable")]
    pub analyst: Option<String>,
    #[serde(deserialize_with = "nullable")]
    pub source_span: Option<String>,
}

// A field with `deserialize_with` and no `default` is required, so this keeps
// `null` legal while making an absent key an error.
fn nullable<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer)
}

/// Page-level facts the model output is attached to.
#[derive(Debug, Clone)]
pub struct ExtractionContext {
    pub source_url: String,
    /// Publication date from page metadata or the search hit.
    pub fallback_date: Option<NaiveDate>,
    pub extracted_at: DateTime<Utc>,
}

impl LlmExtraction {
    pub fn into_candidates(self, ctx: &ExtractionContext) -> Result<Vec<Candidate>, ParseError> {
        let analysis_date = match non_empty(self.analysis_date) {
            Some(s) => Some(NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|_| {
                ParseError::Schema(format!("analysis_date is not YYYY-MM-DD: {s:?}"))
            })?),
            None => ctx.fallback_date,
        };

        self.recommendations
            .into_iter()
            .map(|item| item.into_candidate(analysis_date, ctx))
            .collect()
    }
}

impl LlmCandidate {
    fn into_candidate(
        self,
        analysis_date: Option<NaiveDate>,
        ctx: &ExtractionContext,
    ) -> Result<Candidate, ParseError> {
        let label = non_empty(self.rating_label);
        let rating = match (self.rating, label.as_deref()) {
            (Some(r), _) => Some(r),
            (None, Some(l)) => rating_from_label(l),
            (None, None) => None,
        };

        for (name, value) in [
            ("rating", rating),
            ("price", self.price),
            ("fair_price", self.fair_price),
            ("target_price", self.target_price),
            ("growth_forecast_pct", self.growth_forecast_pct),
            ("pe", self.pe),
        ] {
            if let Some(v) = value {
                if !v.is_finite() {
                    return Err(ParseError::Schema(format!("{name} is not a finite number")));
                }
            }
        }

        Ok(Candidate {
            ticker: self.ticker.trim().to_ascii_uppercase(),
            company_name: non_empty(self.company_name),
            exchange: non_empty(self.exchange).map(|s| s.to_ascii_uppercase()),
            rating,
            price: self.price,
            fair_price: self.fair_price,
            target_price: self.target_price,
            growth_forecast_pct: self.growth_forecast_pct,
            pe: self.pe,
            reasoning: self.reasoning.trim().to_string(),
            analyst: non_empty(self.analyst),
            source_span: non_empty(self.source_span),
            analysis_date,
            source_url: ctx.source_url.clone(),
            extracted_at: ctx.extracted_at,
        })
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("n/a"))
}

/// Maps an explicit rating label or star glyph run onto the 0..=5 scale.
pub fn rating_from_label(label: &str) -> Option<f64> {
    let label = label.trim();
    let stars = label.chars().filter(|c| *c == '★').count();
    if stars > 0 && label.chars().all(|c| c == '★' || c.is_whitespace()) {
        return (stars <= 5).then_some(stars as f64);
    }

    match label.to_ascii_lowercase().as_str() {
        "strong buy" => Some(5.0),
        "buy" => Some(4.0),
        "hold" => Some(3.0),
        "sell" => Some(2.0),
        "strong sell" => Some(1.0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ctx() -> ExtractionContext {
        ExtractionContext {
            source_url: "https://example.com/a".to_string(),
            fallback_date: NaiveDate::from_ymd_opt(2025, 1, 8),
            extracted_at: Utc.with_ymd_and_hms(2025, 1, 11, 9, 0, 0).unwrap(),
        }
    }

    fn item() -> serde_json::Value {
        json!({
            "ticker": "aapl",
            "exchange": "nasdaq",
            "company_name": "Apple",
            "rating": null,
            "rating_label": "Strong Buy",
            "price": null,
            "fair_price": 210,
            "target_price": 225.0,
            "growth_forecast_pct": null,
            "pe": null,
            "reasoning": "  Services growth. ",
            "analyst": null,
            "source_span": "Apple (AAPL, NASDAQ): Strong Buy",
        })
    }

    #[test]
    fn maps_label_and_normalizes_identity() {
        let v = json!({"analysis_date": "2025-01-10", "recommendations": [item()]});
        let parsed: LlmExtraction = serde_json::from_value(v).unwrap();
        let out = parsed.into_candidates(&ctx()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ticker, "AAPL");
        assert_eq!(out[0].exchange.as_deref(), Some("NASDAQ"));
        assert_eq!(out[0].rating, Some(5.0));
        assert_eq!(out[0].fair_price, Some(210.0));
        assert_eq!(out[0].reasoning, "Services growth.");
        assert_eq!(out[0].analysis_date, NaiveDate::from_ymd_opt(2025, 1, 10));
    }

    #[test]
    fn missing_date_falls_back_to_page_date() {
        let v = json!({"analysis_date": null, "recommendations": [item()]});
        let parsed: LlmExtraction = serde_json::from_value(v).unwrap();
        let out = parsed.into_candidates(&ctx()).unwrap();
        assert_eq!(out[0].analysis_date, NaiveDate::from_ymd_opt(2025, 1, 8));
    }

    #[test]
    fn rejects_string_typed_numbers() {
        let mut bad = item();
        bad["fair_price"] = json!("210");
        let v = json!({"analysis_date": null, "recommendations": [bad]});
        assert!(serde_json::from_value::<LlmExtraction>(v).is_err());
    }

    #[test]
    fn rejects_absent_keys_and_unknown_keys() {
        let mut missing = item();
        missing.as_object_mut().unwrap().remove("target_price");
        let v = json!({"analysis_date": null, "recommendations": [missing]});
        assert!(serde_json::from_value::<LlmExtraction>(v).is_err());

        let mut extra = item();
        extra["confidence"] = json!(0.9);
        let v = json!({"analysis_date": null, "recommendations": [extra]});
        assert!(serde_json::from_value::<LlmExtraction>(v).is_err());
    }

    #[test]
    fn rejects_malformed_analysis_date() {
        let v = json!({"analysis_date": "January 2025", "recommendations": [item()]});
        let parsed: LlmExtraction = serde_json::from_value(v).unwrap();
        assert!(matches!(
            parsed.into_candidates(&ctx()),
            Err(ParseError::Schema(_))
        ));
    }

    #[test]
    fn star_and_text_labels() {
        assert_eq!(rating_from_label("★★★★"), Some(4.0));
        assert_eq!(rating_from_label("hold"), Some(3.0));
        assert_eq!(rating_from_label("Outperform"), None);
        assert_eq!(rating_from_label("★★★★★★"), None);
    }
}
