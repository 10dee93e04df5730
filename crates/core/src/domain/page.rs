use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Company identifier or `topic:<template>` the query was planned for.
    pub topic: String,
    pub query: String,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
    pub published: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    /// Fetched and carried through extraction to a persistence decision.
    Processed,
    Timeout,
    Blocked,
    Unsupported,
    Empty,
    /// Fetched, but extraction failed or the run stopped before it finished.
    Incomplete,
}

impl FetchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStatus::Processed => "processed",
            FetchStatus::Timeout => "timeout",
            FetchStatus::Blocked => "blocked",
            FetchStatus::Unsupported => "unsupported",
            FetchStatus::Empty => "empty",
            FetchStatus::Incomplete => "incomplete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "processed" => FetchStatus::Processed,
            "timeout" => FetchStatus::Timeout,
            "blocked" => FetchStatus::Blocked,
            "unsupported" => FetchStatus::Unsupported,
            "empty" => FetchStatus::Empty,
            "incomplete" => FetchStatus::Incomplete,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebPage {
    pub url: String,
    pub title: String,
    pub fetched_at: DateTime<Utc>,
    pub content_hash: Option<String>,
    pub fetch_status: FetchStatus,
}

impl WebPage {
    pub fn url_hash(&self) -> String {
        url_hash(&self.url)
    }
}

/// Storage key for a normalized URL.
pub fn url_hash(normalized_url: &str) -> String {
    sha256_hex(normalized_url.as_bytes())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Normalized page content handed from the scraper to extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapedPage {
    pub url: String,
    pub title: String,
    pub text: String,
    pub content_hash: String,
    pub published: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ParseStatus {
    Parsed { candidates: usize },
    Failed { reason: String },
}

impl ParseStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ParseStatus::Parsed { .. } => "parsed",
            ParseStatus::Failed { .. } => "failed",
        }
    }
}

/// One model call's raw output, kept for audit. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawExtraction {
    pub id: Uuid,
    pub run_id: Uuid,
    pub page_url: String,
    pub provider: String,
    pub raw_output: String,
    pub parse_status: ParseStatus,
    pub created_at: DateTime<Utc>,
}

/// Per-domain fetch behaviour learned across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainPolicy {
    pub domain: String,
    /// `false` once the domain blocked even the rendering backend.
    pub usable: bool,
    pub requires_browser: bool,
    pub updated_at: DateTime<Utc>,
}
