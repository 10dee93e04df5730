//! Anti-hallucination gate. A candidate is accepted whole or rejected with
//! exactly one reason; nothing is partially kept.

use crate::config::env_or;
use crate::domain::recommendation::{AcceptedCandidate, Candidate};
use crate::symbols::CompanyInfo;
use chrono::NaiveDate;
use regex::RegexBuilder;
use std::fmt;

pub const DEFAULT_MAX_PRICE_RATIO: f64 = 3.0;
pub const DEFAULT_STALENESS_DAYS: i64 = 20;

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Largest allowed ratio between any two stated prices (price, fair, target).
    pub max_price_ratio: f64,
    pub staleness_days: i64,
    pub require_ticker_in_text: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_price_ratio: DEFAULT_MAX_PRICE_RATIO,
            staleness_days: DEFAULT_STALENESS_DAYS,
            require_ticker_in_text: true,
        }
    }
}

impl ValidatorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_price_ratio: env_or("VALIDATOR_MAX_PRICE_RATIO", d.max_price_ratio).max(1.0),
            staleness_days: env_or("VALIDATOR_STALENESS_DAYS", d.staleness_days).max(0),
            require_ticker_in_text: env_or(
                "VALIDATOR_REQUIRE_TICKER_IN_TEXT",
                d.require_ticker_in_text,
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    MissingTicker,
    UnknownSymbol {
        ticker: String,
        exchange: Option<String>,
    },
    TickerNotInText,
    RatingOutOfRange(f64),
    NonPositivePrice {
        field: &'static str,
        value: f64,
    },
    InconsistentPrices {
        low_field: &'static str,
        high_field: &'static str,
        ratio: f64,
    },
    FutureDate(NaiveDate),
    StaleDate {
        date: NaiveDate,
        age_days: i64,
    },
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::MissingTicker => "missing_ticker",
            RejectReason::UnknownSymbol { .. } => "unknown_symbol",
            RejectReason::TickerNotInText => "ticker_not_in_text",
            RejectReason::RatingOutOfRange(_) => "rating_out_of_range",
            RejectReason::NonPositivePrice { .. } => "non_positive_price",
            RejectReason::InconsistentPrices { .. } => "inconsistent_prices",
            RejectReason::FutureDate(_) => "future_date",
            RejectReason::StaleDate { .. } => "stale_date",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MissingTicker => f.write_str("missing ticker"),
            RejectReason::UnknownSymbol { ticker, exchange } => match exchange {
                Some(x) => write!(f, "unknown ticker/exchange {ticker}:{x}"),
                None => write!(f, "unknown or ambiguous ticker {ticker}"),
            },
            RejectReason::TickerNotInText => f.write_str("ticker not found in source text"),
            RejectReason::RatingOutOfRange(_) => f.write_str("rating out of range"),
            RejectReason::NonPositivePrice { field, value } => {
                write!(f, "{field} must be positive (got {value})")
            }
            RejectReason::InconsistentPrices {
                low_field,
                high_field,
                ratio,
            } => write!(
                f,
                "{high_field} is {ratio:.1}x {low_field}, prices inconsistent"
            ),
            RejectReason::FutureDate(d) => write!(f, "analysis date {d} is in the future"),
            RejectReason::StaleDate { date, age_days } => {
                write!(f, "analysis date {date} is stale ({age_days} days old)")
            }
        }
    }
}

impl std::error::Error for RejectReason {}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    Accepted(AcceptedCandidate),
    Rejected {
        candidate: Candidate,
        reason: RejectReason,
    },
}

impl ValidationOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ValidationOutcome::Accepted(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Validator {
    cfg: ValidatorConfig,
}

impl Validator {
    pub fn new(cfg: ValidatorConfig) -> Self {
        Self { cfg }
    }

    /// `resolution` is the directory's answer for the candidate's ticker and
    /// exchange; `page_text` is the normalized text the candidate came from.
    pub fn validate(
        &self,
        candidate: Candidate,
        resolution: Option<CompanyInfo>,
        page_text: &str,
        today: NaiveDate,
    ) -> ValidationOutcome {
        match self.check(&candidate, resolution, page_text, today) {
            Ok(company) => ValidationOutcome::Accepted(AcceptedCandidate { candidate, company }),
            Err(reason) => ValidationOutcome::Rejected { candidate, reason },
        }
    }

    fn check(
        &self,
        c: &Candidate,
        resolution: Option<CompanyInfo>,
        page_text: &str,
        today: NaiveDate,
    ) -> Result<CompanyInfo, RejectReason> {
        if c.ticker.trim().is_empty() {
            return Err(RejectReason::MissingTicker);
        }

        if let Some(r) = c.rating {
            if !(0.0..=5.0).contains(&r) {
                return Err(RejectReason::RatingOutOfRange(r));
            }
        }

        let prices = [
            ("price", c.price),
            ("fair_price", c.fair_price),
            ("target_price", c.target_price),
        ];
        for (field, value) in prices {
            if let Some(v) = value {
                if v <= 0.0 {
                    return Err(RejectReason::NonPositivePrice { field, value: v });
                }
            }
        }
        let stated: Vec<(&'static str, f64)> = prices
            .iter()
            .filter_map(|(f, v)| v.map(|v| (*f, v)))
            .collect();
        for (i, (fa, a)) in stated.iter().enumerate() {
            for (fb, b) in &stated[i + 1..] {
                let (low_field, low, high_field, high) =
                    if a <= b { (*fa, *a, *fb, *b) } else { (*fb, *b, *fa, *a) };
                let ratio = high / low;
                if ratio > self.cfg.max_price_ratio {
                    return Err(RejectReason::InconsistentPrices {
                        low_field,
                        high_field,
                        ratio,
                    });
                }
            }
        }

        if let Some(date) = c.analysis_date {
            if date > today {
                return Err(RejectReason::FutureDate(date));
            }
            let age_days = (today - date).num_days();
            if age_days > self.cfg.staleness_days {
                return Err(RejectReason::StaleDate { date, age_days });
            }
        }

        let Some(company) = resolution else {
            return Err(RejectReason::UnknownSymbol {
                ticker: c.ticker.clone(),
                exchange: c.exchange.clone(),
            });
        };

        if self.cfg.require_ticker_in_text && !ticker_in_text(&c.ticker, page_text) {
            return Err(RejectReason::TickerNotInText);
        }

        Ok(company)
    }
}

/// Case-insensitive whole-word match of the ticker in the page text.
pub fn ticker_in_text(ticker: &str, text: &str) -> bool {
    let ticker = ticker.trim();
    if ticker.is_empty() {
        return false;
    }
    RegexBuilder::new(&format!(r"\b{}\b", regex::escape(ticker)))
        .case_insensitive(true)
        .build()
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    const TEXT: &str = "Apple (AAPL, NASDAQ): Strong Buy, fair price $210, target $225, published 2025-01-10";

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 11).unwrap()
    }

    fn apple() -> CompanyInfo {
        CompanyInfo {
            ticker: "AAPL".to_string(),
            exchange: "NASDAQ".to_string(),
            company_name: "Apple Inc.".to_string(),
            mic: Some("XNAS".to_string()),
        }
    }

    fn candidate() -> Candidate {
        Candidate {
            ticker: "AAPL".to_string(),
            company_name: Some("Apple".to_string()),
            exchange: Some("NASDAQ".to_string()),
            rating: Some(5.0),
            price: None,
            fair_price: Some(210.0),
            target_price: Some(225.0),
            growth_forecast_pct: None,
            pe: None,
            reasoning: "Services growth".to_string(),
            analyst: None,
            source_span: None,
            analysis_date: NaiveDate::from_ymd_opt(2025, 1, 10),
            source_url: "https://example.com/a".to_string(),
            extracted_at: Utc.with_ymd_and_hms(2025, 1, 11, 9, 0, 0).unwrap(),
        }
    }

    fn reason(outcome: ValidationOutcome) -> RejectReason {
        match outcome {
            ValidationOutcome::Rejected { reason, .. } => reason,
            ValidationOutcome::Accepted(_) => panic!("expected rejection"),
        }
    }

    #[test]
    fn accepts_consistent_candidate() {
        let v = Validator::default();
        let out = v.validate(candidate(), Some(apple()), TEXT, today());
        match out {
            ValidationOutcome::Accepted(a) => {
                assert_eq!(a.company.company_name, "Apple Inc.");
                assert_eq!(a.into_canonical().company_name.as_deref(), Some("Apple Inc."));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_ticker_is_rejected() {
        let mut c = candidate();
        c.ticker = "ZZZZQ".to_string();
        let r = reason(Validator::default().validate(c, None, "ZZZZQ is a buy", today()));
        assert_eq!(r.code(), "unknown_symbol");
    }

    #[test]
    fn rating_out_of_range() {
        let mut c = candidate();
        c.rating = Some(7.2);
        let r = reason(Validator::default().validate(c, Some(apple()), TEXT, today()));
        assert_eq!(r.to_string(), "rating out of range");

        let mut c = candidate();
        c.rating = Some(0.0);
        assert!(Validator::default()
            .validate(c, Some(apple()), TEXT, today())
            .is_accepted());
    }

    #[test]
    fn price_checks() {
        let mut c = candidate();
        c.fair_price = Some(-1.0);
        let r = reason(Validator::default().validate(c, Some(apple()), TEXT, today()));
        assert_eq!(
            r,
            RejectReason::NonPositivePrice {
                field: "fair_price",
                value: -1.0
            }
        );

        // Target read in cents instead of dollars.
        let mut c = candidate();
        c.target_price = Some(22_500.0);
        let r = reason(Validator::default().validate(c, Some(apple()), TEXT, today()));
        assert_eq!(r.code(), "inconsistent_prices");
    }

    #[test]
    fn date_window() {
        let mut c = candidate();
        c.analysis_date = NaiveDate::from_ymd_opt(2025, 1, 12);
        let r = reason(Validator::default().validate(c, Some(apple()), TEXT, today()));
        assert_eq!(r.code(), "future_date");

        let mut c = candidate();
        c.analysis_date = NaiveDate::from_ymd_opt(2024, 12, 1);
        let r = reason(Validator::default().validate(c, Some(apple()), TEXT, today()));
        assert_eq!(r.code(), "stale_date");

        let mut c = candidate();
        c.analysis_date = None;
        assert!(Validator::default()
            .validate(c, Some(apple()), TEXT, today())
            .is_accepted());
    }

    #[test]
    fn ticker_must_appear_as_word() {
        assert!(ticker_in_text("aapl", TEXT));
        assert!(!ticker_in_text("APP", TEXT));
        assert!(ticker_in_text("BRK.B", "Berkshire (BRK.B) rated Buy"));

        let mut c = candidate();
        c.ticker = "MSFT".to_string();
        let r = reason(Validator::default().validate(c, Some(apple()), TEXT, today()));
        assert_eq!(r, RejectReason::TickerNotInText);
    }

    #[test]
    fn missing_ticker() {
        let mut c = candidate();
        c.ticker = " ".to_string();
        assert_eq!(
            reason(Validator::default().validate(c, None, TEXT, today())),
            RejectReason::MissingTicker
        );
    }
}
