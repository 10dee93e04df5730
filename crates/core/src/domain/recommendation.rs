use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::symbols::CompanyInfo;

/// A stock recommendation as read out of one page, before any validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub ticker: String,
    pub company_name: Option<String>,
    pub exchange: Option<String>,
    /// 0..=5 scale (5 = Strong Buy). `None` when the page states no rating.
    pub rating: Option<f64>,
    pub price: Option<f64>,
    pub fair_price: Option<f64>,
    pub target_price: Option<f64>,
    pub growth_forecast_pct: Option<f64>,
    pub pe: Option<f64>,
    pub reasoning: String,
    pub analyst: Option<String>,
    /// Sentence the model quoted as evidence, when it provided one.
    pub source_span: Option<String>,
    pub analysis_date: Option<NaiveDate>,
    pub source_url: String,
    pub extracted_at: DateTime<Utc>,
}

/// A candidate that passed every validator check, resolved against the symbol directory.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedCandidate {
    pub candidate: Candidate,
    pub company: CompanyInfo,
}

impl AcceptedCandidate {
    /// Replaces model-provided identity fields with the directory's canonical values.
    pub fn into_canonical(self) -> Candidate {
        let AcceptedCandidate {
            mut candidate,
            company,
        } = self;
        candidate.ticker = company.ticker;
        candidate.exchange = Some(company.exchange);
        candidate.company_name = Some(company.company_name);
        candidate
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreFactors {
    pub has_explicit_rating: bool,
    pub has_price_target: bool,
    pub reasoning_words: usize,
    /// Reasoning cites at least one figure (a number, percentage or price).
    pub reasoning_has_figures: bool,
    pub has_analysis_date: bool,
    /// Days between analysis date and extraction; `None` without a date.
    pub age_days: Option<i64>,
    pub has_named_source: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    /// 0..=100, higher means more detailed.
    pub score: i32,
    pub factors: ScoreFactors,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub quality: QualityScore,
}

impl ScoredCandidate {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::for_candidate(&self.candidate)
    }
}

/// Identity used to decide whether two candidates are the same recommendation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey {
    pub ticker: String,
    pub source_url: String,
    pub analysis_date: Option<NaiveDate>,
}

impl DedupKey {
    pub fn for_candidate(candidate: &Candidate) -> Self {
        Self {
            ticker: candidate.ticker.trim().to_ascii_uppercase(),
            source_url: candidate.source_url.clone(),
            analysis_date: candidate.analysis_date,
        }
    }

    /// Flattened form stored in the `dedup_key` column. Undated keys use `-`.
    pub fn as_storage_key(&self) -> String {
        let date = self
            .analysis_date
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string());
        format!("{}|{}|{}", self.ticker, self.source_url, date)
    }
}

impl std::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_storage_key())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecommendation {
    pub id: Uuid,
    pub dedup_key: String,
    pub ticker: String,
    pub exchange: String,
    pub company_name: Option<String>,
    pub rating: Option<f64>,
    pub price: Option<f64>,
    pub fair_price: Option<f64>,
    pub target_price: Option<f64>,
    pub growth_forecast_pct: Option<f64>,
    pub pe: Option<f64>,
    pub reasoning: String,
    pub analyst: Option<String>,
    pub source_span: Option<String>,
    pub analysis_date: Option<NaiveDate>,
    pub source_url: String,
    pub quality_score: i32,
    pub quality_factors: ScoreFactors,
    pub extracted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PersistedRecommendation {
    pub fn from_scored(id: Uuid, scored: &ScoredCandidate, now: DateTime<Utc>) -> Self {
        let c = &scored.candidate;
        Self {
            id,
            dedup_key: scored.dedup_key().as_storage_key(),
            ticker: c.ticker.trim().to_ascii_uppercase(),
            exchange: c.exchange.clone().unwrap_or_default(),
            company_name: c.company_name.clone(),
            rating: c.rating,
            price: c.price,
            fair_price: c.fair_price,
            target_price: c.target_price,
            growth_forecast_pct: c.growth_forecast_pct,
            pe: c.pe,
            reasoning: c.reasoning.clone(),
            analyst: c.analyst.clone(),
            source_span: c.source_span.clone(),
            analysis_date: c.analysis_date,
            source_url: c.source_url.clone(),
            quality_score: scored.quality.score,
            quality_factors: scored.quality.factors.clone(),
            extracted_at: c.extracted_at,
            updated_at: now,
        }
    }
}

/// Read-side filter for the downstream list API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecommendationQuery {
    pub ticker: Option<String>,
    pub exchange: Option<String>,
    pub min_score: Option<i32>,
    pub since: Option<NaiveDate>,
    #[serde(default)]
    pub sort: RecommendationSort,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationSort {
    #[default]
    Score,
    Date,
    Ticker,
}

impl RecommendationQuery {
    pub const DEFAULT_LIMIT: i64 = 100;
    pub const MAX_LIMIT: i64 = 1000;

    pub fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }

    pub fn matches(&self, rec: &PersistedRecommendation) -> bool {
        if let Some(t) = &self.ticker {
            if !rec.ticker.eq_ignore_ascii_case(t.trim()) {
                return false;
            }
        }
        if let Some(x) = &self.exchange {
            if !rec.exchange.eq_ignore_ascii_case(x.trim()) {
                return false;
            }
        }
        if let Some(min) = self.min_score {
            if rec.quality_score < min {
                return false;
            }
        }
        if let Some(since) = self.since {
            match rec.analysis_date {
                Some(d) if d >= since => {}
                _ => return false,
            }
        }
        true
    }
}
