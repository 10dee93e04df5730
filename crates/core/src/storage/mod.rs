pub mod audit;
pub mod domains;
pub mod lock;
pub mod memory;
pub mod pages;
pub mod recommendations;
pub mod runs;
pub mod symbols;

use crate::dedup::DedupDecision;
use crate::domain::page::{DomainPolicy, RawExtraction, WebPage};
use crate::domain::recommendation::{
    DedupKey, PersistedRecommendation, RecommendationQuery, ScoredCandidate,
};
use crate::domain::run::{RejectionRecord, RunCheckpoint};
use anyhow::Context;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub async fn migrate(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("sqlx migrations failed")?;
    Ok(())
}

/// Durable state shared by all workers. Every method is safe to call
/// concurrently; `upsert_recommendation` applies the dedup decision atomically
/// per dedup key.
#[async_trait::async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn get_page(&self, url_hash: &str) -> anyhow::Result<Option<WebPage>>;

    async fn upsert_page(&self, page: &WebPage) -> anyhow::Result<()>;

    async fn get_recommendation(
        &self,
        key: &DedupKey,
    ) -> anyhow::Result<Option<PersistedRecommendation>>;

    /// Reads the record under the candidate's key, runs `dedup::decide` and
    /// applies the result, all under one per-key critical section.
    async fn upsert_recommendation(
        &self,
        scored: &ScoredCandidate,
        now: DateTime<Utc>,
    ) -> anyhow::Result<DedupDecision>;

    async fn list_recommendations(
        &self,
        query: &RecommendationQuery,
    ) -> anyhow::Result<Vec<PersistedRecommendation>>;

    async fn save_checkpoint(&self, checkpoint: &RunCheckpoint) -> anyhow::Result<()>;

    async fn load_checkpoint(&self) -> anyhow::Result<Option<RunCheckpoint>>;

    async fn record_raw_extraction(&self, raw: &RawExtraction) -> anyhow::Result<()>;

    async fn record_rejection(&self, rejection: &RejectionRecord) -> anyhow::Result<()>;

    async fn list_rejections(
        &self,
        run_id: Uuid,
        limit: i64,
    ) -> anyhow::Result<Vec<RejectionRecord>>;

    async fn get_domain_policy(&self, domain: &str) -> anyhow::Result<Option<DomainPolicy>>;

    async fn upsert_domain_policy(&self, policy: &DomainPolicy) -> anyhow::Result<()>;

    /// Cross-process run exclusivity. `false` means another process holds it.
    async fn try_acquire_run_lock(&self) -> anyhow::Result<bool>;

    async fn release_run_lock(&self) -> anyhow::Result<()>;
}

/// Postgres-backed gateway.
pub struct PgStore {
    pool: sqlx::PgPool,
    run_lock: lock::RunLockSlot,
}

impl PgStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self {
            pool,
            run_lock: lock::RunLockSlot::default(),
        }
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl PersistenceGateway for PgStore {
    async fn get_page(&self, url_hash: &str) -> anyhow::Result<Option<WebPage>> {
        pages::get_page(&self.pool, url_hash).await
    }

    async fn upsert_page(&self, page: &WebPage) -> anyhow::Result<()> {
        pages::upsert_page(&self.pool, page).await
    }

    async fn get_recommendation(
        &self,
        key: &DedupKey,
    ) -> anyhow::Result<Option<PersistedRecommendation>> {
        recommendations::get_by_key(&self.pool, &key.as_storage_key()).await
    }

    async fn upsert_recommendation(
        &self,
        scored: &ScoredCandidate,
        now: DateTime<Utc>,
    ) -> anyhow::Result<DedupDecision> {
        recommendations::apply_scored(&self.pool, scored, now).await
    }

    async fn list_recommendations(
        &self,
        query: &RecommendationQuery,
    ) -> anyhow::Result<Vec<PersistedRecommendation>> {
        recommendations::list(&self.pool, query).await
    }

    async fn save_checkpoint(&self, checkpoint: &RunCheckpoint) -> anyhow::Result<()> {
        runs::save_checkpoint(&self.pool, checkpoint).await
    }

    async fn load_checkpoint(&self) -> anyhow::Result<Option<RunCheckpoint>> {
        runs::load_checkpoint(&self.pool).await
    }

    async fn record_raw_extraction(&self, raw: &RawExtraction) -> anyhow::Result<()> {
        audit::insert_raw_extraction(&self.pool, raw).await
    }

    async fn record_rejection(&self, rejection: &RejectionRecord) -> anyhow::Result<()> {
        audit::insert_rejection(&self.pool, rejection).await
    }

    async fn list_rejections(
        &self,
        run_id: Uuid,
        limit: i64,
    ) -> anyhow::Result<Vec<RejectionRecord>> {
        audit::list_rejections(&self.pool, run_id, limit).await
    }

    async fn get_domain_policy(&self, domain: &str) -> anyhow::Result<Option<DomainPolicy>> {
        domains::get_policy(&self.pool, domain).await
    }

    async fn upsert_domain_policy(&self, policy: &DomainPolicy) -> anyhow::Result<()> {
        domains::upsert_policy(&self.pool, policy).await
    }

    async fn try_acquire_run_lock(&self) -> anyhow::Result<bool> {
        self.run_lock.try_acquire(&self.pool).await
    }

    async fn release_run_lock(&self) -> anyhow::Result<()> {
        self.run_lock.release().await
    }
}
