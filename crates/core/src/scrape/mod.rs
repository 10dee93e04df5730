pub mod http;
pub mod normalize;

use crate::domain::page::{sha256_hex, FetchStatus, ScrapedPage};
use normalize::{compact_ws, decode_body, normalize_html, NormalizedHtml};
use std::fmt;
use std::sync::Arc;

/// Bytes as the backend delivered them.
#[derive(Debug, Clone)]
pub struct RawDocument {
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    Timeout,
    Blocked(u16),
    NotFound,
    Unsupported(String),
    /// Connection failures and 5xx.
    Transport(String),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Timeout => f.write_str("fetch timed out"),
            BackendError::Blocked(s) => write!(f, "fetch blocked (status={s})"),
            BackendError::NotFound => f.write_str("page not found"),
            BackendError::Unsupported(d) => write!(f, "unsupported content: {d}"),
            BackendError::Transport(d) => write!(f, "transport error: {d}"),
        }
    }
}

impl std::error::Error for BackendError {}

/// Something that turns a URL into a document: plain HTTP or a rendering service.
#[async_trait::async_trait]
pub trait ScraperBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(&self, url: &str) -> Result<RawDocument, BackendError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchFailure {
    Timeout,
    Blocked(u16),
    Unsupported,
    Empty,
}

impl FetchFailure {
    pub fn fetch_status(&self) -> FetchStatus {
        match self {
            FetchFailure::Timeout => FetchStatus::Timeout,
            FetchFailure::Blocked(_) => FetchStatus::Blocked,
            FetchFailure::Unsupported => FetchStatus::Unsupported,
            FetchFailure::Empty => FetchStatus::Empty,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchFailure::Timeout)
    }
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchFailure::Timeout => f.write_str("timeout"),
            FetchFailure::Blocked(s) => write!(f, "blocked({s})"),
            FetchFailure::Unsupported => f.write_str("unsupported"),
            FetchFailure::Empty => f.write_str("empty"),
        }
    }
}

impl std::error::Error for FetchFailure {}

impl From<BackendError> for FetchFailure {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Timeout | BackendError::Transport(_) => FetchFailure::Timeout,
            BackendError::Blocked(s) => FetchFailure::Blocked(s),
            BackendError::NotFound => FetchFailure::Blocked(404),
            BackendError::Unsupported(_) => FetchFailure::Unsupported,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Direct,
    /// Through the rendering backend; falls back to direct when none is configured.
    Rendered,
}

/// Fetch + normalize. Makes no caching or retry decisions.
#[derive(Clone)]
pub struct Scraper {
    direct: Arc<dyn ScraperBackend>,
    renderer: Option<Arc<dyn ScraperBackend>>,
}

impl Scraper {
    pub fn new(direct: Arc<dyn ScraperBackend>) -> Self {
        Self {
            direct,
            renderer: None,
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn ScraperBackend>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn has_renderer(&self) -> bool {
        self.renderer.is_some()
    }

    pub async fn scrape(&self, url: &str, mode: FetchMode) -> Result<ScrapedPage, FetchFailure> {
        let backend = match (mode, &self.renderer) {
            (FetchMode::Rendered, Some(r)) => r,
            _ => &self.direct,
        };

        let doc = backend.fetch(url).await.map_err(|e| {
            tracing::debug!(%url, backend = backend.name(), error = %e, "fetch failed");
            FetchFailure::from(e)
        })?;
        normalize_document(url, &doc)
    }
}

pub fn normalize_document(url: &str, doc: &RawDocument) -> Result<ScrapedPage, FetchFailure> {
    let kind = content_kind(doc.content_type.as_deref()).ok_or(FetchFailure::Unsupported)?;
    if doc.body.is_empty() {
        return Err(FetchFailure::Empty);
    }

    let decoded = decode_body(&doc.body, doc.content_type.as_deref());
    let page = match kind {
        ContentKind::Html => normalize_html(&decoded),
        ContentKind::PlainText => NormalizedHtml {
            title: String::new(),
            text: compact_ws(&decoded),
            published: None,
        },
    };
    if page.text.is_empty() {
        return Err(FetchFailure::Empty);
    }

    Ok(ScrapedPage {
        url: url.to_string(),
        title: page.title,
        content_hash: sha256_hex(page.text.as_bytes()),
        text: page.text,
        published: page.published,
    })
}

enum ContentKind {
    Html,
    PlainText,
}

fn content_kind(content_type: Option<&str>) -> Option<ContentKind> {
    let Some(ct) = content_type else {
        return Some(ContentKind::Html);
    };
    let mime = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    match mime.as_str() {
        "" | "text/html" | "application/xhtml+xml" => Some(ContentKind::Html),
        "text/plain" => Some(ContentKind::PlainText),
        _ => None,
    }
}
