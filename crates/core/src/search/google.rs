use crate::config::{env_or, Settings};
use crate::domain::page::{SearchHit, SearchQuery};
use crate::search::{SearchError, SearchGateway};
use crate::time::published::first_published_date;
use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/customsearch/v1";
const DEFAULT_MAX_RESULTS: u32 = 10;
const DEFAULT_MAX_AGE_DAYS: u32 = 20;
const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// Google Programmable Search (Custom Search JSON API), newest results first.
#[derive(Debug, Clone)]
pub struct GoogleSearch {
    http: reqwest::Client,
    api_key: String,
    cse_id: String,
    base_url: String,
    max_results: u32,
    max_age_days: u32,
}

impl GoogleSearch {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let api_key = settings.require_google_api_key()?.to_string();
        let cse_id = settings.require_google_cse_id()?.to_string();
        let base_url =
            std::env::var("GOOGLE_CSE_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        // The API caps `num` at 10.
        let max_results = env_or("SEARCH_MAX_RESULTS", DEFAULT_MAX_RESULTS).clamp(1, 10);
        let max_age_days = env_or("SEARCH_MAX_AGE_DAYS", DEFAULT_MAX_AGE_DAYS).max(1);
        let timeout_secs = env_or("SEARCH_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build reqwest client")?;

        Ok(Self {
            http,
            api_key,
            cse_id,
            base_url,
            max_results,
            max_age_days,
        })
    }

    fn hits_from_response(res: CseResponse) -> Vec<SearchHit> {
        res.items
            .into_iter()
            .filter(|item| !item.link.trim().is_empty())
            .map(|item| {
                let published = item
                    .pagemap
                    .as_ref()
                    .and_then(|p| p.metatags.first())
                    .and_then(|meta| first_published_date(|k| meta.get(k).and_then(|v| v.as_str())));
                SearchHit {
                    url: item.link,
                    title: item.title,
                    snippet: item.snippet,
                    published,
                }
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl SearchGateway for GoogleSearch {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>, SearchError> {
        let num = self.max_results.to_string();
        let date_restrict = format!("d{}", self.max_age_days);
        let res = self
            .http
            .get(&self.base_url)
            .query(&[
                ("key", self.api_key.as_str()),
                ("cx", self.cse_id.as_str()),
                ("q", query.query.as_str()),
                ("num", num.as_str()),
                ("dateRestrict", date_restrict.as_str()),
                ("sort", "date"),
            ])
            .send()
            .await
            .map_err(|e| SearchError::Unavailable(e.to_string()))?;

        let status = res.status();
        if status.as_u16() == 429 {
            return Err(SearchError::RateLimited);
        }
        let body = res
            .text()
            .await
            .map_err(|e| SearchError::Unavailable(e.to_string()))?;
        if !status.is_success() {
            // Daily quota exhaustion comes back as 403 with a rate-limit reason.
            if status.as_u16() == 403 && body.contains("rateLimitExceeded") {
                return Err(SearchError::RateLimited);
            }
            return Err(SearchError::Unavailable(format!("status={status}")));
        }

        let parsed = serde_json::from_str::<CseResponse>(&body)
            .map_err(|e| SearchError::Unavailable(format!("bad response body: {e}")))?;
        Ok(Self::hits_from_response(parsed))
    }
}

#[derive(Debug, Deserialize)]
struct CseResponse {
    #[serde(default)]
    items: Vec<CseItem>,
}

#[derive(Debug, Deserialize)]
struct CseItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    link: String,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    pagemap: Option<CsePagemap>,
}

#[derive(Debug, Deserialize)]
struct CsePagemap {
    #[serde(default)]
    metatags: Vec<HashMap<String, serde_json::Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    #[test]
    fn maps_items_and_metatag_dates() {
        let res: CseResponse = serde_json::from_value(json!({
            "items": [
                {
                    "title": "3 Undervalued Stocks",
                    "link": "https://www.fool.com/a",
                    "snippet": "Apple...",
                    "pagemap": {"metatags": [{"article:published_time": "2025-01-10T12:00:00Z"}]}
                },
                {"title": "No date", "link": "https://zacks.com/b", "snippet": ""},
                {"title": "No link", "snippet": "dropped"}
            ]
        }))
        .unwrap();
        let hits = GoogleSearch::hits_from_response(res);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].published, NaiveDate::from_ymd_opt(2025, 1, 10));
        assert_eq!(hits[1].published, None);
    }

    #[test]
    fn empty_result_set_has_no_items_key() {
        let res: CseResponse = serde_json::from_value(json!({"kind": "customsearch#search"})).unwrap();
        assert!(GoogleSearch::hits_from_response(res).is_empty());
    }
}
