//! Deterministic quality score, 0..=100.
//!
//! | factor                              | points |
//! |-------------------------------------|--------|
//! | explicit numeric rating             | 25     |
//! | price target (target or fair price) | 20     |
//! | reasoning length, full at 50 words  | 0..=20 |
//! | reasoning cites figures             | 5      |
//! | analysis date present               | 10     |
//! | recency, linear over the window     | 0..=10 |
//! | named analyst/source                | 10     |
//!
//! Weights are constants so scores stay comparable between runs.

use crate::domain::recommendation::{Candidate, QualityScore, ScoreFactors, ScoredCandidate};
use crate::validate::DEFAULT_STALENESS_DAYS;

pub const W_EXPLICIT_RATING: i32 = 25;
pub const W_PRICE_TARGET: i32 = 20;
pub const W_REASONING_LENGTH: i32 = 20;
pub const W_REASONING_FIGURES: i32 = 5;
pub const W_DATE_PRESENT: i32 = 10;
pub const W_RECENCY: i32 = 10;
pub const W_NAMED_SOURCE: i32 = 10;

pub const REASONING_FULL_WORDS: usize = 50;

/// Accepted candidates below this are still stored, but logged as low quality.
pub const LOW_QUALITY_THRESHOLD: i32 = 40;

#[derive(Debug, Clone)]
pub struct QualityScorer {
    recency_window_days: i64,
}

impl Default for QualityScorer {
    fn default() -> Self {
        Self::new(DEFAULT_STALENESS_DAYS)
    }
}

impl QualityScorer {
    /// `recency_window_days` should match the validator's staleness window.
    pub fn new(recency_window_days: i64) -> Self {
        Self {
            recency_window_days: recency_window_days.max(1),
        }
    }

    pub fn score(&self, candidate: Candidate) -> ScoredCandidate {
        let factors = factors_of(&candidate);
        let score = self.points(&factors);
        ScoredCandidate {
            candidate,
            quality: QualityScore { score, factors },
        }
    }

    fn points(&self, f: &ScoreFactors) -> i32 {
        let mut score = 0;
        if f.has_explicit_rating {
            score += W_EXPLICIT_RATING;
        }
        if f.has_price_target {
            score += W_PRICE_TARGET;
        }
        let words = f.reasoning_words.min(REASONING_FULL_WORDS) as i32;
        score += W_REASONING_LENGTH * words / REASONING_FULL_WORDS as i32;
        if f.reasoning_has_figures {
            score += W_REASONING_FIGURES;
        }
        if f.has_analysis_date {
            score += W_DATE_PRESENT;
        }
        if let Some(age) = f.age_days {
            let left = (self.recency_window_days - age.max(0)).max(0);
            score += (W_RECENCY as i64 * left / self.recency_window_days) as i32;
        }
        if f.has_named_source {
            score += W_NAMED_SOURCE;
        }
        score.clamp(0, 100)
    }
}

fn factors_of(c: &Candidate) -> ScoreFactors {
    let reasoning = c.reasoning.trim();
    ScoreFactors {
        has_explicit_rating: c.rating.is_some(),
        has_price_target: c.target_price.is_some() || c.fair_price.is_some(),
        reasoning_words: reasoning.split_whitespace().count(),
        reasoning_has_figures: reasoning.chars().any(|ch| ch.is_ascii_digit()),
        has_analysis_date: c.analysis_date.is_some(),
        age_days: c
            .analysis_date
            .map(|d| (c.extracted_at.date_naive() - d).num_days()),
        has_named_source: c.analyst.as_deref().is_some_and(|a| !a.trim().is_empty()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn bare() -> Candidate {
        Candidate {
            ticker: "AAPL".to_string(),
            company_name: None,
            exchange: Some("NASDAQ".to_string()),
            rating: None,
            price: None,
            fair_price: None,
            target_price: None,
            growth_forecast_pct: None,
            pe: None,
            reasoning: String::new(),
            analyst: None,
            source_span: None,
            analysis_date: None,
            source_url: "https://example.com/a".to_string(),
            extracted_at: Utc.with_ymd_and_hms(2025, 1, 11, 9, 0, 0).unwrap(),
        }
    }

    #[test]
    fn empty_candidate_scores_zero() {
        assert_eq!(QualityScorer::default().score(bare()).quality.score, 0);
    }

    #[test]
    fn each_weight_is_applied() {
        let s = QualityScorer::new(20);

        let mut c = bare();
        c.rating = Some(4.0);
        assert_eq!(s.score(c).quality.score, W_EXPLICIT_RATING);

        let mut c = bare();
        c.fair_price = Some(210.0);
        assert_eq!(s.score(c).quality.score, W_PRICE_TARGET);

        let mut c = bare();
        c.analyst = Some("Jane Doe, CFA".to_string());
        assert_eq!(s.score(c).quality.score, W_NAMED_SOURCE);

        let mut c = bare();
        c.reasoning = "word ".repeat(25);
        assert_eq!(s.score(c).quality.score, W_REASONING_LENGTH / 2);

        let mut c = bare();
        c.reasoning = "Margins rose 12%".to_string();
        // 3 words -> 20*3/50 = 1, plus figures.
        assert_eq!(s.score(c).quality.score, 1 + W_REASONING_FIGURES);
    }

    #[test]
    fn recency_decays_linearly() {
        let s = QualityScorer::new(20);
        let mut c = bare();
        c.analysis_date = NaiveDate::from_ymd_opt(2025, 1, 11);
        assert_eq!(s.score(c.clone()).quality.score, W_DATE_PRESENT + W_RECENCY);

        c.analysis_date = NaiveDate::from_ymd_opt(2025, 1, 1);
        assert_eq!(s.score(c.clone()).quality.score, W_DATE_PRESENT + 5);

        c.analysis_date = NaiveDate::from_ymd_opt(2024, 11, 1);
        let scored = s.score(c);
        assert_eq!(scored.quality.score, W_DATE_PRESENT);
        assert_eq!(scored.quality.factors.age_days, Some(71));
    }

    #[test]
    fn detailed_recommendation_clears_low_quality_threshold() {
        let mut c = bare();
        c.rating = Some(5.0);
        c.fair_price = Some(210.0);
        c.target_price = Some(225.0);
        c.analysis_date = NaiveDate::from_ymd_opt(2025, 1, 10);
        let scored = QualityScorer::default().score(c);
        assert!(scored.quality.score > LOW_QUALITY_THRESHOLD);
        assert!(scored.quality.factors.has_explicit_rating);
        assert!(scored.quality.factors.has_price_target);
    }

    #[test]
    fn same_input_same_score() {
        let mut c = bare();
        c.rating = Some(3.0);
        c.reasoning = "Cheap on 11x earnings with net cash".to_string();
        let s = QualityScorer::default();
        assert_eq!(s.score(c.clone()).quality, s.score(c).quality);
    }
}
