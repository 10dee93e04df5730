//! Search query planning.
//!
//! Pure: no I/O. The same config, clock date and coverage set always yield the
//! same query list, which is what makes the plan fingerprint meaningful.

use crate::config::{env_list, env_or};
use crate::domain::page::{sha256_hex, SearchQuery};
use crate::symbols::normalize_exchange;
use chrono::{DateTime, Datelike, Utc};
use std::collections::HashSet;

pub const DEFAULT_TOPIC_TEMPLATES: &[&str] = &[
    "undervalued stocks site:{site}",
    "best value stocks site:{site}",
    "stocks to buy site:{site}",
];

pub const DEFAULT_COMPANY_TEMPLATES: &[&str] =
    &["{company} {ticker} stock rating price target {month} {year}"];

pub const DEFAULT_SITES: &[&str] = &[
    "reuters.com",
    "morningstar.com",
    "finance.yahoo.com",
    "fool.com",
    "zacks.com",
    "seekingalpha.com",
];

pub const DEFAULT_MAX_QUERIES: usize = 40;

/// A tracked company the planner builds per-company queries for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub ticker: String,
    pub exchange: String,
    pub company_name: String,
}

impl Target {
    pub fn new(ticker: &str, exchange: &str, company_name: &str) -> Self {
        Self {
            ticker: ticker.trim().to_ascii_uppercase(),
            exchange: normalize_exchange(exchange),
            company_name: company_name.trim().to_string(),
        }
    }

    /// Company identifier used for per-run coverage.
    pub fn key(&self) -> String {
        format!("{}:{}", self.exchange, self.ticker)
    }

    /// Parses `TICKER:EXCHANGE:Company Name`; the name may itself contain colons.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(3, ':');
        let ticker = parts.next()?.trim();
        let exchange = parts.next()?.trim();
        let name = parts.next().map(str::trim).unwrap_or(ticker);
        if ticker.is_empty() || exchange.is_empty() {
            return None;
        }
        Some(Self::new(ticker, exchange, name))
    }
}

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Templates not tied to a company; `{site}` expands over `sites`.
    pub topic_templates: Vec<String>,
    /// Per-target templates: `{company}`, `{ticker}`, `{exchange}`, optionally `{site}`.
    pub company_templates: Vec<String>,
    pub sites: Vec<String>,
    pub targets: Vec<Target>,
    pub max_queries: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            topic_templates: DEFAULT_TOPIC_TEMPLATES.iter().map(|s| s.to_string()).collect(),
            company_templates: DEFAULT_COMPANY_TEMPLATES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            sites: DEFAULT_SITES.iter().map(|s| s.to_string()).collect(),
            targets: Vec::new(),
            max_queries: DEFAULT_MAX_QUERIES,
        }
    }
}

impl PlannerConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_list("PLANNER_TOPIC_TEMPLATES", '|') {
            cfg.topic_templates = v;
        }
        if let Some(v) = env_list("PLANNER_COMPANY_TEMPLATES", '|') {
            cfg.company_templates = v;
        }
        if let Some(v) = env_list("PLANNER_SITES", ',') {
            cfg.sites = v;
        }
        if let Some(v) = env_list("PLANNER_TARGETS", ';') {
            cfg.targets = v.iter().filter_map(|s| Target::parse(s)).collect();
        }
        cfg.max_queries = env_or("PLANNER_MAX_QUERIES", cfg.max_queries);
        cfg
    }
}

#[derive(Debug, Clone)]
pub struct QueryPlanner {
    cfg: PlannerConfig,
}

impl QueryPlanner {
    pub fn new(cfg: PlannerConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.cfg
    }

    /// Builds the bounded, deduplicated query list for one run cycle.
    ///
    /// Targets whose key is already in `covered` are skipped; every target that
    /// gets at least one query is added to it.
    pub fn plan(&self, issued_at: DateTime<Utc>, covered: &mut HashSet<String>) -> Vec<SearchQuery> {
        let mut out: Vec<SearchQuery> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let max = self.cfg.max_queries;

        let mut push = |topic: &str, query: String, out: &mut Vec<SearchQuery>| -> bool {
            if out.len() >= max {
                return false;
            }
            let query = collapse_whitespace(&query);
            if query.is_empty() || !seen.insert(query.to_ascii_lowercase()) {
                return false;
            }
            out.push(SearchQuery {
                topic: topic.to_string(),
                query,
                issued_at,
            });
            true
        };

        for target in &self.cfg.targets {
            let key = target.key();
            if covered.contains(&key) {
                continue;
            }
            let mut emitted = false;
            for template in &self.cfg.company_templates {
                for q in self.expand(template, Some(target), issued_at) {
                    emitted |= push(&key, q, &mut out);
                }
            }
            if emitted {
                covered.insert(key);
            }
        }

        for template in &self.cfg.topic_templates {
            let topic = format!("topic:{template}");
            for q in self.expand(template, None, issued_at) {
                push(&topic, q, &mut out);
            }
        }

        out
    }

    fn expand(
        &self,
        template: &str,
        target: Option<&Target>,
        issued_at: DateTime<Utc>,
    ) -> Vec<String> {
        let mut base = template
            .replace("{year}", &issued_at.year().to_string())
            .replace("{month}", month_name(issued_at.month()));
        if let Some(t) = target {
            base = base
                .replace("{company}", &t.company_name)
                .replace("{ticker}", &t.ticker)
                .replace("{exchange}", &t.exchange);
        } else if base.contains("{company}") || base.contains("{ticker}") {
            return Vec::new();
        }

        if base.contains("{site}") {
            self.cfg
                .sites
                .iter()
                .map(|site| base.replace("{site}", site))
                .collect()
        } else {
            vec![base]
        }
    }
}

/// Stable identity of a query list; resume only applies to an identical plan.
pub fn plan_fingerprint(queries: &[SearchQuery]) -> String {
    let joined = queries
        .iter()
        .map(|q| q.query.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    sha256_hex(joined.as_bytes())
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn month_name(m: u32) -> &'static str {
    match m {
        1 => "January",
        2 => "February",
        3 => "March",
        4 => "April",
        5 => "May",
        6 => "June",
        7 => "July",
        8 => "August",
        9 => "September",
        10 => "October",
        11 => "November",
        _ => "December",
    }
}
