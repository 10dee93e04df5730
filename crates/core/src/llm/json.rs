use crate::domain::contract::LlmExtraction;
use crate::llm::error::ParseError;
use crate::llm::LlmResponse;

pub fn extract_json(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.starts_with("```") {
        // Remove Markdown fences (```json ... ``` or ``` ... ```).
        let mut inner = trimmed;
        if let Some(after_first) = inner.splitn(2, '\n').nth(1) {
            inner = after_first;
        }
        if let Some(end) = inner.rfind("```") {
            inner = &inner[..end];
        }
        return Some(inner.trim().to_string());
    }

    // Best-effort extraction: first '{' to last '}'.
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(trimmed[start..=end].trim().to_string())
}

/// Reads the extraction contract out of a provider reply. The structured
/// payload wins; free text is only searched when there is none.
pub fn parse_extraction(res: &LlmResponse) -> Result<LlmExtraction, ParseError> {
    if let Some(value) = &res.structured {
        return serde_json::from_value::<LlmExtraction>(value.clone())
            .map_err(|e| ParseError::Schema(e.to_string()));
    }

    let json_str = extract_json(&res.text).ok_or(ParseError::NoPayload)?;
    let value = serde_json::from_str::<serde_json::Value>(&json_str)
        .map_err(|e| ParseError::NotJson(e.to_string()))?;
    serde_json::from_value::<LlmExtraction>(value).map_err(|e| ParseError::Schema(e.to_string()))
}

/// JSON schema for `LlmExtraction`, shared by both providers. Every key is
/// required; optional facts are typed as nullable.
pub fn extraction_schema() -> serde_json::Value {
    let nullable_number = serde_json::json!({"type": ["number", "null"]});
    let nullable_string = serde_json::json!({"type": ["string", "null"]});

    serde_json::json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["analysis_date", "recommendations"],
        "properties": {
            "analysis_date": {
                "type": ["string", "null"],
                "description": "Publication/analysis date stated in the text, YYYY-MM-DD"
            },
            "recommendations": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": [
                        "ticker", "exchange", "company_name", "rating", "rating_label",
                        "price", "fair_price", "target_price", "growth_forecast_pct", "pe",
                        "reasoning", "analyst", "source_span"
                    ],
                    "properties": {
                        "ticker": {"type": "string"},
                        "exchange": nullable_string,
                        "company_name": nullable_string,
                        "rating": {
                            "type": ["number", "null"],
                            "description": "Numeric rating on a 0-5 scale, only if stated"
                        },
                        "rating_label": {
                            "type": ["string", "null"],
                            "description": "Rating wording as written, e.g. Strong Buy"
                        },
                        "price": nullable_number,
                        "fair_price": nullable_number,
                        "target_price": nullable_number,
                        "growth_forecast_pct": nullable_number,
                        "pe": nullable_number,
                        "reasoning": {"type": "string"},
                        "analyst": nullable_string,
                        "source_span": {
                            "type": ["string", "null"],
                            "description": "Exact sentence the recommendation was read from"
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(structured: Option<serde_json::Value>, text: &str) -> LlmResponse {
        LlmResponse {
            raw_output: text.to_string(),
            structured,
            text: text.to_string(),
        }
    }

    #[test]
    fn extract_json_handles_fenced_blocks() {
        let body = "{\"a\":1}";
        let fenced = format!("```json\n{body}\n```\n");
        assert_eq!(extract_json(&fenced), Some(body.to_string()));
    }

    #[test]
    fn extract_json_falls_back_to_braces() {
        let s = "prefix {\"a\":1} suffix";
        assert_eq!(extract_json(s), Some("{\"a\":1}".to_string()));
    }

    #[test]
    fn parses_empty_recommendation_list_from_text() {
        let res = response(None, "```json\n{\"analysis_date\": null, \"recommendations\": []}\n```");
        let parsed = parse_extraction(&res).unwrap();
        assert!(parsed.recommendations.is_empty());
    }

    #[test]
    fn structured_payload_takes_precedence() {
        let res = response(
            Some(json!({"analysis_date": "2025-01-10", "recommendations": []})),
            "not json at all",
        );
        let parsed = parse_extraction(&res).unwrap();
        assert_eq!(parsed.analysis_date.as_deref(), Some("2025-01-10"));
    }

    #[test]
    fn classifies_failures() {
        assert!(matches!(
            parse_extraction(&response(None, "I could not find anything.")),
            Err(ParseError::NoPayload)
        ));
        assert!(matches!(
            parse_extraction(&response(None, "{ recommendations: [ }")),
            Err(ParseError::NotJson(_))
        ));
        assert!(matches!(
            parse_extraction(&response(None, "{\"recommendations\": []}")),
            Err(ParseError::Schema(_))
        ));
    }

    #[test]
    fn schema_requires_every_candidate_key() {
        let schema = extraction_schema();
        let required = schema["properties"]["recommendations"]["items"]["required"]
            .as_array()
            .unwrap()
            .len();
        let props = schema["properties"]["recommendations"]["items"]["properties"]
            .as_object()
            .unwrap()
            .len();
        assert_eq!(required, props);
    }
}
