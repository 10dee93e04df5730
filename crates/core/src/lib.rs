pub mod dedup;
pub mod domain;
pub mod extract;
pub mod llm;
pub mod planner;
pub mod score;
pub mod scrape;
pub mod search;
pub mod storage;
pub mod symbols;
pub mod time;
pub mod validate;
pub mod workflow;

pub mod config {
    use anyhow::Context;

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub database_url: Option<String>,
        pub llm_provider: Option<String>,
        pub anthropic_api_key: Option<String>,
        pub openai_api_key: Option<String>,
        pub google_api_key: Option<String>,
        pub google_cse_id: Option<String>,
        pub render_service_url: Option<String>,
        pub sentry_dsn: Option<String>,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            Ok(Self {
                database_url: std::env::var("DATABASE_URL").ok(),
                llm_provider: std::env::var("LLM_PROVIDER").ok(),
                anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
                openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
                google_api_key: std::env::var("GOOGLE_API_KEY").ok(),
                google_cse_id: std::env::var("GOOGLE_CSE_ID").ok(),
                render_service_url: std::env::var("RENDER_SERVICE_URL")
                    .ok()
                    .filter(|s| !s.trim().is_empty()),
                sentry_dsn: std::env::var("SENTRY_DSN").ok(),
            })
        }

        pub fn require_database_url(&self) -> anyhow::Result<&str> {
            self.database_url
                .as_deref()
                .context("DATABASE_URL is required")
        }

        pub fn require_anthropic_api_key(&self) -> anyhow::Result<&str> {
            self.anthropic_api_key
                .as_deref()
                .context("ANTHROPIC_API_KEY is required")
        }

        pub fn require_openai_api_key(&self) -> anyhow::Result<&str> {
            self.openai_api_key
                .as_deref()
                .context("OPENAI_API_KEY is required")
        }

        pub fn require_google_api_key(&self) -> anyhow::Result<&str> {
            self.google_api_key
                .as_deref()
                .context("GOOGLE_API_KEY is required")
        }

        pub fn require_google_cse_id(&self) -> anyhow::Result<&str> {
            self.google_cse_id
                .as_deref()
                .context("GOOGLE_CSE_ID is required")
        }
    }

    /// Parses an env var into `T`, falling back to `default` when unset or unparsable.
    pub fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
        std::env::var(key)
            .ok()
            .and_then(|s| s.trim().parse::<T>().ok())
            .unwrap_or(default)
    }

    /// Splits a delimited env var into trimmed, non-empty parts.
    pub fn env_list(key: &str, sep: char) -> Option<Vec<String>> {
        let raw = std::env::var(key).ok()?;
        let parts: Vec<String> = raw
            .split(sep)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts)
        }
    }
}
