pub mod google;

use crate::domain::page::{SearchHit, SearchQuery};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchError {
    RateLimited,
    Unavailable(String),
}

impl fmt::Display for SearchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchError::RateLimited => f.write_str("search backend rate limited the request"),
            SearchError::Unavailable(d) => write!(f, "search backend unavailable: {d}"),
        }
    }
}

impl std::error::Error for SearchError {}

/// Runs one query against a web search backend. Single attempt; the
/// orchestrator owns retries.
#[async_trait::async_trait]
pub trait SearchGateway: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>, SearchError>;
}
