use super::PersistenceGateway;
use crate::dedup::{self, DedupDecision};
use crate::domain::page::{DomainPolicy, RawExtraction, WebPage};
use crate::domain::recommendation::{
    DedupKey, PersistedRecommendation, RecommendationQuery, RecommendationSort, ScoredCandidate,
};
use crate::domain::run::{RejectionRecord, RunCheckpoint};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct State {
    pages: HashMap<String, WebPage>,
    recommendations: HashMap<String, PersistedRecommendation>,
    checkpoint: Option<RunCheckpoint>,
    raw_extractions: Vec<RawExtraction>,
    rejections: Vec<RejectionRecord>,
    domains: HashMap<String, DomainPolicy>,
    run_locked: bool,
}

/// Process-local gateway for `--dry-run` and tests. One mutex guards all
/// state, so dedup decisions are trivially atomic.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn recommendations(&self) -> Vec<PersistedRecommendation> {
        let st = self.state.lock().await;
        let mut out: Vec<_> = st.recommendations.values().cloned().collect();
        out.sort_by(|a, b| a.dedup_key.cmp(&b.dedup_key));
        out
    }

    pub async fn raw_extractions(&self) -> Vec<RawExtraction> {
        self.state.lock().await.raw_extractions.clone()
    }

    pub async fn pages(&self) -> Vec<WebPage> {
        let st = self.state.lock().await;
        let mut out: Vec<_> = st.pages.values().cloned().collect();
        out.sort_by(|a, b| a.url.cmp(&b.url));
        out
    }
}

#[async_trait::async_trait]
impl PersistenceGateway for MemoryStore {
    async fn get_page(&self, url_hash: &str) -> anyhow::Result<Option<WebPage>> {
        Ok(self.state.lock().await.pages.get(url_hash).cloned())
    }

    async fn upsert_page(&self, page: &WebPage) -> anyhow::Result<()> {
        let mut st = self.state.lock().await;
        let mut page = page.clone();
        if page.content_hash.is_none() {
            page.content_hash = st
                .pages
                .get(&page.url_hash())
                .and_then(|p| p.content_hash.clone());
        }
        st.pages.insert(page.url_hash(), page);
        Ok(())
    }

    async fn get_recommendation(
        &self,
        key: &DedupKey,
    ) -> anyhow::Result<Option<PersistedRecommendation>> {
        Ok(self
            .state
            .lock()
            .await
            .recommendations
            .get(&key.as_storage_key())
            .cloned())
    }

    async fn upsert_recommendation(
        &self,
        scored: &ScoredCandidate,
        now: DateTime<Utc>,
    ) -> anyhow::Result<DedupDecision> {
        let key = scored.dedup_key().as_storage_key();
        let mut st = self.state.lock().await;
        let existing = st.recommendations.get(&key);
        let decision = dedup::decide(scored, existing);
        let id = existing.map(|e| e.id).unwrap_or_else(Uuid::new_v4);
        if decision != DedupDecision::Discard {
            st.recommendations
                .insert(key, PersistedRecommendation::from_scored(id, scored, now));
        }
        Ok(decision)
    }

    async fn list_recommendations(
        &self,
        query: &RecommendationQuery,
    ) -> anyhow::Result<Vec<PersistedRecommendation>> {
        let st = self.state.lock().await;
        let mut out: Vec<_> = st
            .recommendations
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        match query.sort {
            RecommendationSort::Score => out.sort_by(|a, b| {
                b.quality_score
                    .cmp(&a.quality_score)
                    .then(b.extracted_at.cmp(&a.extracted_at))
            }),
            RecommendationSort::Date => out.sort_by(|a, b| {
                // None sorts last.
                b.analysis_date
                    .cmp(&a.analysis_date)
                    .then(b.quality_score.cmp(&a.quality_score))
            }),
            RecommendationSort::Ticker => out.sort_by(|a, b| {
                a.ticker
                    .cmp(&b.ticker)
                    .then(b.quality_score.cmp(&a.quality_score))
            }),
        }
        out.truncate(query.effective_limit() as usize);
        Ok(out)
    }

    async fn save_checkpoint(&self, checkpoint: &RunCheckpoint) -> anyhow::Result<()> {
        self.state.lock().await.checkpoint = Some(checkpoint.clone());
        Ok(())
    }

    async fn load_checkpoint(&self) -> anyhow::Result<Option<RunCheckpoint>> {
        Ok(self.state.lock().await.checkpoint.clone())
    }

    async fn record_raw_extraction(&self, raw: &RawExtraction) -> anyhow::Result<()> {
        self.state.lock().await.raw_extractions.push(raw.clone());
        Ok(())
    }

    async fn record_rejection(&self, rejection: &RejectionRecord) -> anyhow::Result<()> {
        self.state.lock().await.rejections.push(rejection.clone());
        Ok(())
    }

    async fn list_rejections(
        &self,
        run_id: Uuid,
        limit: i64,
    ) -> anyhow::Result<Vec<RejectionRecord>> {
        let st = self.state.lock().await;
        Ok(st
            .rejections
            .iter()
            .filter(|r| r.run_id == run_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn get_domain_policy(&self, domain: &str) -> anyhow::Result<Option<DomainPolicy>> {
        Ok(self.state.lock().await.domains.get(domain).cloned())
    }

    async fn upsert_domain_policy(&self, policy: &DomainPolicy) -> anyhow::Result<()> {
        self.state
            .lock()
            .await
            .domains
            .insert(policy.domain.clone(), policy.clone());
        Ok(())
    }

    async fn try_acquire_run_lock(&self) -> anyhow::Result<bool> {
        let mut st = self.state.lock().await;
        if st.run_locked {
            return Ok(false);
        }
        st.run_locked = true;
        Ok(true)
    }

    async fn release_run_lock(&self) -> anyhow::Result<()> {
        self.state.lock().await.run_locked = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::page::FetchStatus;
    use crate::domain::recommendation::{Candidate, QualityScore, ScoreFactors};
    use chrono::{NaiveDate, TimeZone};
    use std::sync::Arc;

    fn scored(ticker: &str, url: &str, score: i32, hour: u32) -> ScoredCandidate {
        ScoredCandidate {
            candidate: Candidate {
                ticker: ticker.to_string(),
                company_name: None,
                exchange: Some("NASDAQ".to_string()),
                rating: Some(4.0),
                price: None,
                fair_price: None,
                target_price: None,
                growth_forecast_pct: None,
                pe: None,
                reasoning: "r".to_string(),
                analyst: None,
                source_span: None,
                analysis_date: NaiveDate::from_ymd_opt(2025, 1, 10),
                source_url: url.to_string(),
                extracted_at: Utc.with_ymd_and_hms(2025, 1, 11, hour, 0, 0).unwrap(),
            },
            quality: QualityScore {
                score,
                factors: ScoreFactors {
                    has_explicit_rating: true,
                    has_price_target: false,
                    reasoning_words: 1,
                    reasoning_has_figures: false,
                    has_analysis_date: true,
                    age_days: Some(1),
                    has_named_source: false,
                },
            },
        }
    }

    #[tokio::test]
    async fn replace_keeps_record_id() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let low = scored("AAPL", "https://a.example/x", 40, 8);
        let high = scored("AAPL", "https://a.example/x", 85, 9);

        assert_eq!(
            store.upsert_recommendation(&low, now).await.unwrap(),
            DedupDecision::Insert
        );
        let id = store.recommendations().await[0].id;
        assert_eq!(
            store.upsert_recommendation(&high, now).await.unwrap(),
            DedupDecision::Replace
        );
        let recs = store.recommendations().await;
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].id, id);
        assert_eq!(recs[0].quality_score, 85);
    }

    #[tokio::test]
    async fn concurrent_upserts_leave_one_record_per_key() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for score in [10, 85, 40, 60] {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let s = scored("MSFT", "https://b.example/y", score, 9);
                store.upsert_recommendation(&s, Utc::now()).await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let recs = store.recommendations().await;
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].quality_score, 85);
    }

    #[tokio::test]
    async fn list_filters_and_sorts() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for (t, url, s) in [
            ("AAPL", "https://a.example/1", 50),
            ("AAPL", "https://a.example/2", 90),
            ("MSFT", "https://a.example/3", 70),
        ] {
            store
                .upsert_recommendation(&scored(t, url, s, 9), now)
                .await
                .unwrap();
        }

        let all = store
            .list_recommendations(&RecommendationQuery::default())
            .await
            .unwrap();
        let scores: Vec<i32> = all.iter().map(|r| r.quality_score).collect();
        assert_eq!(scores, vec![90, 70, 50]);

        let q = RecommendationQuery {
            ticker: Some("aapl".to_string()),
            min_score: Some(60),
            ..Default::default()
        };
        let hits = store.list_recommendations(&q).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source_url, "https://a.example/2");
    }

    #[tokio::test]
    async fn page_upsert_keeps_previous_content_hash() {
        let store = MemoryStore::new();
        let mut page = WebPage {
            url: "https://a.example/x".to_string(),
            title: "t".to_string(),
            fetched_at: Utc::now(),
            content_hash: Some("h1".to_string()),
            fetch_status: FetchStatus::Processed,
        };
        store.upsert_page(&page).await.unwrap();
        page.content_hash = None;
        page.fetch_status = FetchStatus::Timeout;
        store.upsert_page(&page).await.unwrap();

        let got = store.get_page(&page.url_hash()).await.unwrap().unwrap();
        assert_eq!(got.content_hash.as_deref(), Some("h1"));
        assert_eq!(got.fetch_status, FetchStatus::Timeout);
    }

    #[tokio::test]
    async fn run_lock_is_exclusive() {
        let store = MemoryStore::new();
        assert!(store.try_acquire_run_lock().await.unwrap());
        assert!(!store.try_acquire_run_lock().await.unwrap());
        store.release_run_lock().await.unwrap();
        assert!(store.try_acquire_run_lock().await.unwrap());
    }
}
