pub mod master;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyInfo {
    pub ticker: String,
    pub exchange: String,
    pub company_name: String,
    pub mic: Option<String>,
}

/// Ground-truth listing lookup used by the validator.
#[async_trait::async_trait]
pub trait ReferenceSymbolDirectory: Send + Sync {
    /// All known listings for `ticker` (any exchange).
    async fn listings(&self, ticker: &str) -> anyhow::Result<Vec<CompanyInfo>>;

    /// Resolves a ticker/exchange pair. Without an exchange the ticker must be
    /// listed exactly once; otherwise the answer is `None`.
    async fn resolve(
        &self,
        ticker: &str,
        exchange: Option<&str>,
    ) -> anyhow::Result<Option<CompanyInfo>> {
        let listings = self.listings(&ticker.trim().to_ascii_uppercase()).await?;
        Ok(pick_listing(listings, exchange))
    }
}

pub fn pick_listing(listings: Vec<CompanyInfo>, exchange: Option<&str>) -> Option<CompanyInfo> {
    match exchange.map(normalize_exchange) {
        Some(wanted) => listings
            .into_iter()
            .find(|l| normalize_exchange(&l.exchange) == wanted),
        None => {
            if listings.len() == 1 {
                listings.into_iter().next()
            } else {
                None
            }
        }
    }
}

/// Canonical exchange code, folding the vendor spellings seen in articles.
pub fn normalize_exchange(raw: &str) -> String {
    let s: String = raw
        .trim()
        .to_ascii_uppercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    match s.as_str() {
        "NASDAQGS" | "NASDAQGM" | "NASDAQCM" | "NMS" | "NGS" | "XNAS" | "NASDAQGLOBALSELECT"
        | "NASDAQGLOBALMARKET" | "NASDAQCAPITALMARKET" => "NASDAQ".to_string(),
        "NYQ" | "XNYS" | "NEWYORKSTOCKEXCHANGE" => "NYSE".to_string(),
        "LON" | "XLON" | "LONDONSTOCKEXCHANGE" => "LSE".to_string(),
        "GER" | "XETR" | "ETR" => "XETRA".to_string(),
        "TSX" | "XTSE" | "TOR" => "TSX".to_string(),
        _ => s,
    }
}

/// Directory backed by a fixed listing set (tests, dry runs, imported masters).
#[derive(Debug, Clone, Default)]
pub struct InMemorySymbolDirectory {
    by_ticker: HashMap<String, Vec<CompanyInfo>>,
}

impl InMemorySymbolDirectory {
    pub fn new<I>(listings: I) -> Self
    where
        I: IntoIterator<Item = CompanyInfo>,
    {
        let mut by_ticker: HashMap<String, Vec<CompanyInfo>> = HashMap::new();
        for l in listings {
            by_ticker
                .entry(l.ticker.trim().to_ascii_uppercase())
                .or_default()
                .push(l);
        }
        Self { by_ticker }
    }

    pub fn len(&self) -> usize {
        self.by_ticker.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ticker.is_empty()
    }
}

#[async_trait::async_trait]
impl ReferenceSymbolDirectory for InMemorySymbolDirectory {
    async fn listings(&self, ticker: &str) -> anyhow::Result<Vec<CompanyInfo>> {
        Ok(self
            .by_ticker
            .get(&ticker.trim().to_ascii_uppercase())
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(ticker: &str, exchange: &str, name: &str) -> CompanyInfo {
        CompanyInfo {
            ticker: ticker.to_string(),
            exchange: exchange.to_string(),
            company_name: name.to_string(),
            mic: None,
        }
    }

    #[tokio::test]
    async fn resolves_exchange_aliases() {
        let dir = InMemorySymbolDirectory::new([info("AAPL", "NASDAQ", "Apple Inc.")]);
        let hit = dir.resolve("aapl", Some("NasdaqGS")).await.unwrap();
        assert_eq!(hit.map(|c| c.company_name), Some("Apple Inc.".to_string()));
        assert!(dir.resolve("AAPL", Some("NYSE")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_ticker_is_not_found() {
        let dir = InMemorySymbolDirectory::new([info("AAPL", "NASDAQ", "Apple Inc.")]);
        assert!(dir.resolve("ZZZZQ", Some("NASDAQ")).await.unwrap().is_none());
        assert!(dir.resolve("ZZZZQ", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_exchange_requires_unique_listing() {
        let dir = InMemorySymbolDirectory::new([
            info("SHEL", "NYSE", "Shell plc"),
            info("SHEL", "LSE", "Shell plc"),
            info("MSFT", "NASDAQ", "Microsoft"),
        ]);
        assert!(dir.resolve("SHEL", None).await.unwrap().is_none());
        assert!(dir.resolve("MSFT", None).await.unwrap().is_some());
        assert_eq!(dir.len(), 3);
    }
}
