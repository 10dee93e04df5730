use crate::domain::recommendation::{PersistedRecommendation, ScoredCandidate};

/// What the store should do with a new scored candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupDecision {
    Insert,
    Replace,
    /// The stored record is at least as good.
    Discard,
}

impl DedupDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupDecision::Insert => "insert",
            DedupDecision::Replace => "replace",
            DedupDecision::Discard => "discard",
        }
    }
}

/// Decides against the record currently stored under the same dedup key.
///
/// Higher quality wins; on a tie the more recently extracted one wins. Records
/// for the same ticker under other keys are never considered, so independent
/// opinions from different sources coexist.
pub fn decide(new: &ScoredCandidate, existing: Option<&PersistedRecommendation>) -> DedupDecision {
    let Some(existing) = existing else {
        return DedupDecision::Insert;
    };

    let new_score = new.quality.score;
    if new_score > existing.quality_score {
        DedupDecision::Replace
    } else if new_score == existing.quality_score
        && new.candidate.extracted_at > existing.extracted_at
    {
        DedupDecision::Replace
    } else {
        DedupDecision::Discard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::recommendation::{Candidate, QualityScore, ScoreFactors};
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};
    use uuid::Uuid;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 11, hour, 0, 0).unwrap()
    }

    fn scored(score: i32, extracted_at: DateTime<Utc>, url: &str) -> ScoredCandidate {
        ScoredCandidate {
            candidate: Candidate {
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
                analysis_date: NaiveDate::from_ymd_opt(2025, 1, 10),
                source_url: url.to_string(),
                extracted_at,
            },
            quality: QualityScore {
                score,
                factors: ScoreFactors {
                    has_explicit_rating: false,
                    has_price_target: false,
                    reasoning_words: 0,
                    reasoning_has_figures: false,
                    has_analysis_date: true,
                    age_days: Some(1),
                    has_named_source: false,
                },
            },
        }
    }

    fn stored(s: &ScoredCandidate) -> PersistedRecommendation {
        PersistedRecommendation::from_scored(Uuid::nil(), s, s.candidate.extracted_at)
    }

    #[test]
    fn insert_when_key_is_new() {
        assert_eq!(decide(&scored(40, at(9), "u"), None), DedupDecision::Insert);
    }

    #[test]
    fn higher_score_wins_in_either_order() {
        let low = scored(40, at(9), "u");
        let high = scored(85, at(8), "u");
        assert_eq!(decide(&high, Some(&stored(&low))), DedupDecision::Replace);
        assert_eq!(decide(&low, Some(&stored(&high))), DedupDecision::Discard);
    }

    #[test]
    fn tie_keeps_most_recent_extraction() {
        let older = scored(60, at(8), "u");
        let newer = scored(60, at(9), "u");
        assert_eq!(decide(&newer, Some(&stored(&older))), DedupDecision::Replace);
        assert_eq!(decide(&older, Some(&stored(&newer))), DedupDecision::Discard);
        assert_eq!(decide(&older, Some(&stored(&older))), DedupDecision::Discard);
    }

    #[test]
    fn different_sources_have_different_keys() {
        let a = scored(60, at(8), "https://a.example/x");
        let b = scored(60, at(8), "https://b.example/y");
        assert_ne!(a.dedup_key(), b.dedup_key());
    }
}
