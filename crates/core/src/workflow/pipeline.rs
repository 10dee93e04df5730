//! Per-URL chain: fetch -> extract -> validate -> score -> dedup-decide.
//!
//! Every stage hands a typed value to the next. Collaborator failures that
//! only affect this URL end up in `UrlOutcome`; an `Err` from
//! `process_url` means the store failed and the run cannot continue.

use super::state::{RunTracker, Stage};
use super::WorkflowConfig;
use crate::config::Settings;
use crate::dedup::DedupDecision;
use crate::domain::page::{url_hash, DomainPolicy, FetchStatus, ScrapedPage, SearchHit, WebPage};
use crate::domain::recommendation::Candidate;
use crate::domain::run::RejectionRecord;
use crate::extract::ExtractionEngine;
use crate::llm::error::{is_retryable, ParseError};
use crate::llm::client_from_settings;
use crate::planner::{PlannerConfig, QueryPlanner};
use crate::score::{QualityScorer, LOW_QUALITY_THRESHOLD};
use crate::scrape::http::{HttpBackend, RenderServiceBackend};
use crate::scrape::normalize::{domain_of, normalize_url};
use crate::scrape::{FetchFailure, FetchMode, Scraper};
use crate::search::google::GoogleSearch;
use crate::search::SearchGateway;
use crate::storage::PersistenceGateway;
use crate::symbols::ReferenceSymbolDirectory;
use crate::validate::{ValidationOutcome, Validator, ValidatorConfig};
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Every collaborator a run needs.
pub struct Pipeline {
    pub planner: QueryPlanner,
    pub search: Arc<dyn SearchGateway>,
    pub scraper: Scraper,
    pub extractor: ExtractionEngine,
    pub symbols: Arc<dyn ReferenceSymbolDirectory>,
    pub validator: Validator,
    pub scorer: QualityScorer,
    pub store: Arc<dyn PersistenceGateway>,
    pub clock: Clock,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateTally {
    pub accepted: u64,
    pub rejected: u64,
    pub persisted: u64,
    pub discarded: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UrlOutcome {
    InvalidUrl,
    DomainUnusable,
    /// Processed recently enough that it was not fetched again.
    Fresh,
    FetchFailed(FetchFailure),
    /// Fetched, but the content hash matches the last processed version.
    Unchanged,
    /// The model call failed after retries.
    ExtractionFailed,
    ParseFailed(ParseError),
    Processed(CandidateTally),
}

impl Pipeline {
    /// Production collaborators: Google search, plain HTTP plus the optional
    /// render service, and the configured model provider.
    pub fn from_settings(
        settings: &Settings,
        planner: PlannerConfig,
        symbols: Arc<dyn ReferenceSymbolDirectory>,
        store: Arc<dyn PersistenceGateway>,
    ) -> anyhow::Result<Self> {
        let search = GoogleSearch::from_settings(settings)?;

        let mut scraper = Scraper::new(Arc::new(HttpBackend::from_env()?));
        if let Some(renderer) = RenderServiceBackend::from_settings(settings)? {
            scraper = scraper.with_renderer(Arc::new(renderer));
        }

        let llm = client_from_settings(settings)?;
        tracing::info!(
            provider = llm.provider().as_str(),
            renderer = scraper.has_renderer(),
            targets = planner.targets.len(),
            "pipeline configured"
        );

        Ok(Self {
            planner: QueryPlanner::new(planner),
            search: Arc::new(search),
            scraper,
            extractor: ExtractionEngine::new(llm),
            symbols,
            validator: Validator::new(ValidatorConfig::from_env()),
            scorer: QualityScorer::default(),
            store,
            clock: system_clock(),
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub(crate) async fn process_url(
        &self,
        cfg: &WorkflowConfig,
        run: &RunTracker,
        hit: &SearchHit,
    ) -> anyhow::Result<UrlOutcome> {
        let Some(url) = normalize_url(&hit.url) else {
            tracing::debug!(url = %hit.url, "skipping non-http url");
            return Ok(UrlOutcome::InvalidUrl);
        };
        let domain = domain_of(&url).unwrap_or_default();

        let policy = self.store.get_domain_policy(&domain).await?;
        if policy.as_ref().is_some_and(|p| !p.usable) {
            tracing::debug!(%url, %domain, "domain marked unusable; skipping");
            return Ok(UrlOutcome::DomainUnusable);
        }
        let mode = if policy.as_ref().is_some_and(|p| p.requires_browser) {
            FetchMode::Rendered
        } else {
            FetchMode::Direct
        };

        let now = self.now();
        let prior = self.store.get_page(&url_hash(&url)).await?;
        if let Some(p) = &prior {
            if p.fetch_status == FetchStatus::Processed && now - p.fetched_at < cfg.refetch_interval
            {
                run.incr(Stage::Unchanged);
                return Ok(UrlOutcome::Fresh);
            }
        }

        let page = match self.fetch(cfg, &url, &domain, mode).await? {
            Ok(page) => page,
            Err(failure) => {
                tracing::info!(%url, %failure, "fetch failed; skipping url");
                run.incr(Stage::Errored);
                // A processed row keeps its status so the next fetch of the
                // same content still compares against it.
                let was_processed = prior
                    .as_ref()
                    .is_some_and(|p| p.fetch_status == FetchStatus::Processed);
                if !was_processed {
                    self.store
                        .upsert_page(&WebPage {
                            url: url.clone(),
                            title: hit.title.clone(),
                            fetched_at: now,
                            content_hash: None,
                            fetch_status: failure.fetch_status(),
                        })
                        .await?;
                }
                return Ok(UrlOutcome::FetchFailed(failure));
            }
        };
        run.incr(Stage::Fetched);

        if let Some(p) = &prior {
            if p.fetch_status == FetchStatus::Processed
                && p.content_hash.as_deref() == Some(page.content_hash.as_str())
            {
                run.incr(Stage::Unchanged);
                self.store
                    .upsert_page(&page_record(&url, &page, FetchStatus::Processed, now))
                    .await?;
                return Ok(UrlOutcome::Unchanged);
            }
        }

        let candidates = match self.extract(cfg, run, &url, &page, hit.published, now).await? {
            Ok(candidates) => candidates,
            Err(outcome) => {
                run.incr(Stage::Errored);
                self.store
                    .upsert_page(&page_record(&url, &page, FetchStatus::Incomplete, now))
                    .await?;
                return Ok(outcome);
            }
        };
        run.incr(Stage::Extracted);

        let tally = self.decide(run, &url, &page, candidates, now).await?;

        self.store
            .upsert_page(&page_record(&url, &page, FetchStatus::Processed, now))
            .await?;
        Ok(UrlOutcome::Processed(tally))
    }

    /// Fetches with retries. A direct fetch refused with 403 is retried once
    /// through the renderer, and the result is remembered per domain.
    async fn fetch(
        &self,
        cfg: &WorkflowConfig,
        url: &str,
        domain: &str,
        mode: FetchMode,
    ) -> anyhow::Result<Result<ScrapedPage, FetchFailure>> {
        let res = self.fetch_with_retry(cfg, url, mode).await;
        let can_render = self.scraper.has_renderer() && !domain.is_empty();

        match res {
            Err(FetchFailure::Blocked(403)) if can_render && mode == FetchMode::Direct => {
                tracing::info!(%url, %domain, "blocked; retrying through renderer");
                let rendered = self.fetch_with_retry(cfg, url, FetchMode::Rendered).await;
                let usable = match &rendered {
                    Ok(_) => true,
                    Err(FetchFailure::Blocked(_)) => false,
                    Err(_) => return Ok(rendered),
                };
                self.remember_domain(domain, usable).await?;
                Ok(rendered)
            }
            Err(FetchFailure::Blocked(403)) if can_render && mode == FetchMode::Rendered => {
                self.remember_domain(domain, false).await?;
                Ok(res)
            }
            other => Ok(other),
        }
    }

    async fn fetch_with_retry(
        &self,
        cfg: &WorkflowConfig,
        url: &str,
        mode: FetchMode,
    ) -> Result<ScrapedPage, FetchFailure> {
        cfg.retry
            .run(
                "fetch",
                || self.scraper.scrape(url, mode),
                FetchFailure::is_retryable,
            )
            .await
    }

    async fn remember_domain(&self, domain: &str, usable: bool) -> anyhow::Result<()> {
        if !usable {
            tracing::warn!(%domain, "domain blocks the renderer too; marking unusable");
        }
        self.store
            .upsert_domain_policy(&DomainPolicy {
                domain: domain.to_string(),
                usable,
                requires_browser: true,
                updated_at: self.now(),
            })
            .await
    }

    /// `Ok(Err(outcome))` means this URL is done without candidates.
    async fn extract(
        &self,
        cfg: &WorkflowConfig,
        run: &RunTracker,
        url: &str,
        page: &ScrapedPage,
        fallback_date: Option<NaiveDate>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Result<Vec<Candidate>, UrlOutcome>> {
        let extractor: &ExtractionEngine = &self.extractor;
        let res = cfg
            .retry
            .run(
                "extract",
                || extractor.extract(run.run_id, page, fallback_date, now),
                is_retryable,
            )
            .await;

        let outcome = match res {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(%url, error = %format!("{err:#}"), "extraction call failed");
                return Ok(Err(UrlOutcome::ExtractionFailed));
            }
        };

        self.store.record_raw_extraction(&outcome.raw).await?;

        match outcome.candidates {
            Ok(candidates) => {
                tracing::debug!(%url, candidates = candidates.len(), "extracted");
                Ok(Ok(candidates))
            }
            Err(parse) => {
                tracing::warn!(
                    %url,
                    error = %parse,
                    raw_output = %outcome.raw.raw_output,
                    "model output broke the extraction contract; skipping page"
                );
                Ok(Err(UrlOutcome::ParseFailed(parse)))
            }
        }
    }

    async fn decide(
        &self,
        run: &RunTracker,
        url: &str,
        page: &ScrapedPage,
        candidates: Vec<Candidate>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<CandidateTally> {
        let today = now.date_naive();
        let mut tally = CandidateTally::default();

        for candidate in candidates {
            let resolution = self
                .symbols
                .resolve(&candidate.ticker, candidate.exchange.as_deref())
                .await?;

            match self
                .validator
                .validate(candidate, resolution, &page.text, today)
            {
                ValidationOutcome::Rejected { candidate, reason } => {
                    run.incr(Stage::Rejected);
                    tally.rejected += 1;
                    tracing::info!(
                        %url,
                        ticker = %candidate.ticker,
                        code = reason.code(),
                        %reason,
                        "candidate rejected"
                    );
                    self.store
                        .record_rejection(&RejectionRecord {
                            run_id: run.run_id,
                            page_url: url.to_string(),
                            ticker: candidate.ticker,
                            exchange: candidate.exchange,
                            reason: reason.to_string(),
                            rejected_at: now,
                        })
                        .await?;
                }
                ValidationOutcome::Accepted(accepted) => {
                    run.incr(Stage::Accepted);
                    tally.accepted += 1;

                    let scored = self.scorer.score(accepted.into_canonical());
                    if scored.quality.score < LOW_QUALITY_THRESHOLD {
                        tracing::warn!(
                            %url,
                            ticker = %scored.candidate.ticker,
                            score = scored.quality.score,
                            "low-quality recommendation"
                        );
                    }

                    let decision = self.store.upsert_recommendation(&scored, now).await?;
                    tracing::debug!(
                        key = %scored.dedup_key(),
                        score = scored.quality.score,
                        decision = decision.as_str(),
                        "dedup decision applied"
                    );
                    match decision {
                        DedupDecision::Insert | DedupDecision::Replace => {
                            run.incr(Stage::Persisted);
                            tally.persisted += 1;
                        }
                        DedupDecision::Discard => {
                            run.incr(Stage::Discarded);
                            tally.discarded += 1;
                        }
                    }
                }
            }
        }

        Ok(tally)
    }
}

fn page_record(url: &str, page: &ScrapedPage, status: FetchStatus, now: DateTime<Utc>) -> WebPage {
    WebPage {
        url: url.to_string(),
        title: page.title.clone(),
        fetched_at: now,
        content_hash: Some(page.content_hash.clone()),
        fetch_status: status,
    }
}
