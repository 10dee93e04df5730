pub mod pipeline;
pub mod retry;
pub mod state;


use crate::config::env_or;
use crate::domain::page::{SearchHit, SearchQuery};
use crate::domain::run::{RejectionRecord, RunCursor, RunState, RunStatus, StartRunResponse};
use crate::planner::plan_fingerprint;
use crate::scrape::normalize::normalize_url;
use futures::stream::{self, StreamExt};
use pipeline::{Pipeline, UrlOutcome};
use retry::RetryPolicy;
use state::{RunTracker, Stage};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

const STOPPED_MESSAGE: &str = "run stopped before completion";

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// URLs processed concurrently.
    pub workers: usize,
    /// Save a checkpoint after this many finished URLs.
    pub checkpoint_every: usize,
    /// Pages processed more recently than this are not fetched again.
    pub refetch_interval: chrono::Duration,
    pub retry: RetryPolicy,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            checkpoint_every: 5,
            refetch_interval: chrono::Duration::hours(24),
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkflowConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            workers: env_or("WORKFLOW_WORKERS", d.workers).clamp(1, 16),
            checkpoint_every: env_or("WORKFLOW_CHECKPOINT_EVERY", d.checkpoint_every).max(1),
            refetch_interval: chrono::Duration::hours(env_or(
                "WORKFLOW_REFETCH_INTERVAL_HOURS",
                d.refetch_interval.num_hours(),
            )),
            retry: RetryPolicy::from_env(),
        }
    }
}

enum RunEnd {
    Completed,
    Stopped,
}

/// A run that passed the start checks and is ready to be driven.
struct PreparedRun {
    tracker: Arc<RunTracker>,
    queries: Vec<SearchQuery>,
    start_query: usize,
}

/// Owns the process-wide "is a run active" state and drives runs through
/// `IDLE -> RUNNING -> {COMPLETED, FAILED}`.
///
/// `running` is the only admission gate: it is set by a single
/// compare-and-swap in `start_run`/`run_once` and cleared once the run's
/// terminal checkpoint has been written. `current` keeps the latest run for
/// status queries until the next run replaces it.
pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    cfg: WorkflowConfig,
    running: AtomicBool,
    current: RwLock<Option<Arc<RunTracker>>>,
}

impl Orchestrator {
    pub fn new(pipeline: Pipeline, cfg: WorkflowConfig) -> Arc<Self> {
        Arc::new(Self {
            pipeline: Arc::new(pipeline),
            cfg,
            running: AtomicBool::new(false),
            current: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.cfg
    }

    /// Starts a run in the background. A request while a run is active is
    /// refused and answered with the active run's status.
    pub async fn start_run(self: &Arc<Self>) -> StartRunResponse {
        match self.admit().await {
            Ok(prepared) => {
                let this = Arc::clone(self);
                let current_status = prepared.tracker.status().await;
                tokio::spawn(async move {
                    this.drive(prepared).await;
                });
                StartRunResponse {
                    accepted: true,
                    current_status,
                }
            }
            Err(reason) => {
                let mut current_status = self.get_run_status().await;
                if current_status.state != RunState::Running {
                    current_status.last_error = Some(reason);
                }
                StartRunResponse {
                    accepted: false,
                    current_status,
                }
            }
        }
    }

    /// Runs to a terminal state on the caller's task. `None` when the run
    /// was not admitted.
    pub async fn run_once(self: &Arc<Self>) -> Option<RunStatus> {
        match self.admit().await {
            Ok(prepared) => {
                let tracker = prepared.tracker.clone();
                self.drive(prepared).await;
                Some(tracker.status().await)
            }
            Err(reason) => {
                tracing::warn!(%reason, "run not started");
                None
            }
        }
    }

    pub async fn get_run_status(&self) -> RunStatus {
        if let Some(t) = self.current.read().await.as_ref() {
            return t.status().await;
        }
        match self.pipeline.store.load_checkpoint().await {
            Ok(Some(cp)) => state::status_from_checkpoint(cp),
            Ok(None) => RunStatus::idle(),
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "load checkpoint failed");
                RunStatus::idle()
            }
        }
    }

    /// Cooperative: in-flight URLs finish, no new URL starts. Returns whether
    /// a running run received the signal.
    pub async fn stop_run(&self) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        match self.current.read().await.as_ref() {
            Some(t) => {
                tracing::info!(run_id = %t.run_id, "stop requested");
                t.request_stop();
                true
            }
            None => false,
        }
    }

    /// Rejections recorded by the current (or last checkpointed) run.
    pub async fn rejections(&self, limit: i64) -> anyhow::Result<Vec<RejectionRecord>> {
        let run_id = match self.current.read().await.as_ref() {
            Some(t) => Some(t.run_id),
            None => self
                .pipeline
                .store
                .load_checkpoint()
                .await?
                .map(|cp| cp.run_id),
        };
        match run_id {
            Some(id) => self.pipeline.store.list_rejections(id, limit).await,
            None => Ok(Vec::new()),
        }
    }

    async fn admit(&self) -> Result<PreparedRun, String> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err("a run is already in progress".to_string());
        }

        match self.prepare().await {
            Ok(Some(prepared)) => {
                *self.current.write().await = Some(prepared.tracker.clone());
                Ok(prepared)
            }
            Ok(None) => {
                self.running.store(false, Ordering::Release);
                Err("another process holds the run lock".to_string())
            }
            Err(err) => {
                self.running.store(false, Ordering::Release);
                let _ = self.pipeline.store.release_run_lock().await;
                tracing::error!(error = %format!("{err:#}"), "run could not start");
                Err(format!("{err:#}"))
            }
        }
    }

    /// Takes the store's run lock, plans queries and writes the initial checkpoint.
    async fn prepare(&self) -> anyhow::Result<Option<PreparedRun>> {
        let store = &self.pipeline.store;
        if !store.try_acquire_run_lock().await? {
            return Ok(None);
        }

        let now = self.pipeline.now();
        let mut covered = HashSet::new();
        let queries = self.pipeline.planner.plan(now, &mut covered);
        let fingerprint = plan_fingerprint(&queries);

        let start_query = match store.load_checkpoint().await? {
            Some(prev)
                if prev.state != RunState::Completed
                    && prev.plan_fingerprint == fingerprint
                    && prev.cursor.query_index < queries.len() =>
            {
                tracing::info!(
                    previous_run = %prev.run_id,
                    previous_state = %prev.state,
                    query_index = prev.cursor.query_index,
                    "resuming from checkpoint"
                );
                prev.cursor.query_index
            }
            _ => 0,
        };

        let tracker = Arc::new(RunTracker::new(
            Uuid::new_v4(),
            now,
            fingerprint,
            queries.len() as u64,
            start_query,
        ));
        store.save_checkpoint(&tracker.checkpoint(now).await).await?;

        tracing::info!(
            run_id = %tracker.run_id,
            queries = queries.len(),
            covered_targets = covered.len(),
            start_query,
            workers = self.cfg.workers,
            "run started"
        );
        Ok(Some(PreparedRun {
            tracker,
            queries,
            start_query,
        }))
    }

    async fn drive(&self, prepared: PreparedRun) {
        let tracker = prepared.tracker.clone();
        let result = self.execute(prepared).await;

        let (to, last_error) = match result {
            Ok(RunEnd::Completed) => (RunState::Completed, None),
            Ok(RunEnd::Stopped) => (RunState::Failed, Some(STOPPED_MESSAGE.to_string())),
            Err(err) => {
                tracing::error!(
                    run_id = %tracker.run_id,
                    error = %format!("{err:#}"),
                    "run failed"
                );
                (RunState::Failed, Some(format!("{err:#}")))
            }
        };

        let now = self.pipeline.now();
        if let Err(err) = tracker.finish(to, last_error, now).await {
            tracing::error!(run_id = %tracker.run_id, error = %err, "finish run failed");
        }

        let store = &self.pipeline.store;
        if let Err(err) = store.save_checkpoint(&tracker.checkpoint(now).await).await {
            // The last successful checkpoint stays in place for the next run.
            tracing::error!(error = %format!("{err:#}"), "save final checkpoint failed");
        }
        if let Err(err) = store.release_run_lock().await {
            tracing::warn!(error = %format!("{err:#}"), "release run lock failed");
        }

        let counts = tracker.counts();
        tracing::info!(
            run_id = %tracker.run_id,
            state = %to,
            fetched = counts.fetched,
            accepted = counts.accepted,
            rejected = counts.rejected,
            persisted = counts.persisted,
            errored = counts.errored,
            "run finished"
        );
        self.running.store(false, Ordering::Release);
    }

    async fn execute(&self, prepared: PreparedRun) -> anyhow::Result<RunEnd> {
        let PreparedRun {
            tracker,
            queries,
            start_query,
        } = prepared;
        let mut seen_urls: HashSet<String> = HashSet::new();

        for (qi, query) in queries.iter().enumerate().skip(start_query) {
            if tracker.stop_requested() {
                return Ok(RunEnd::Stopped);
            }
            tracker.set_cursor(&RunCursor {
                query_index: qi,
                url_index: 0,
            });

            let hits = self.search(&tracker, query).await;
            let hits: Vec<SearchHit> = hits
                .into_iter()
                .filter(|h| match normalize_url(&h.url) {
                    Some(u) => seen_urls.insert(u),
                    None => true,
                })
                .collect();
            tracker.add(Stage::UrlsFound, hits.len() as u64);

            self.process_hits(&tracker, qi, &hits).await?;

            if tracker.stop_requested() {
                return Ok(RunEnd::Stopped);
            }
            tracker.incr(Stage::QueriesDone);
            tracker.set_cursor(&RunCursor {
                query_index: qi + 1,
                url_index: 0,
            });
            self.checkpoint(&tracker).await?;
        }

        Ok(RunEnd::Completed)
    }

    /// A failed search costs one query, never the run.
    async fn search(&self, tracker: &RunTracker, query: &SearchQuery) -> Vec<SearchHit> {
        let search = &self.pipeline.search;
        let res = self
            .cfg
            .retry
            .run("search", || search.search(query), |_| true)
            .await;
        match res {
            Ok(hits) => {
                tracing::debug!(query = %query.query, hits = hits.len(), "search done");
                hits
            }
            Err(err) => {
                tracing::warn!(query = %query.query, error = %err, "search failed; skipping query");
                tracker.incr(Stage::Errored);
                Vec::new()
            }
        }
    }

    /// Bounded worker pool over one query's hits. The cursor only advances
    /// over a contiguous prefix of finished URLs.
    async fn process_hits(
        &self,
        tracker: &Arc<RunTracker>,
        query_index: usize,
        hits: &[SearchHit],
    ) -> anyhow::Result<()> {
        let pipeline = &self.pipeline;
        let cfg = &self.cfg;

        let mut results = stream::iter(hits.to_vec().into_iter().enumerate())
            .map(|(ui, hit): (usize, SearchHit)| {
                let tracker = tracker.clone();
                async move {
                    // Checked between URLs only; a started URL runs to the end.
                    if tracker.stop_requested() {
                        return (ui, Ok(None));
                    }
                    let res = pipeline.process_url(cfg, &tracker, &hit).await;
                    (ui, res.map(Some))
                }
            })
            .buffer_unordered(cfg.workers.max(1));

        let mut done = vec![false; hits.len()];
        let mut prefix = 0usize;
        let mut since_checkpoint = 0usize;

        while let Some((ui, res)) = results.next().await {
            match res {
                Ok(Some(outcome)) => {
                    if let UrlOutcome::Processed(t) = &outcome {
                        tracing::debug!(
                            url = %hits[ui].url,
                            accepted = t.accepted,
                            rejected = t.rejected,
                            persisted = t.persisted,
                            "url processed"
                        );
                    }
                }
                Ok(None) => continue,
                Err(err) => {
                    return Err(err.context(format!("processing {} failed", hits[ui].url)));
                }
            }

            done[ui] = true;
            while prefix < done.len() && done[prefix] {
                prefix += 1;
            }
            tracker.set_cursor(&RunCursor {
                query_index,
                url_index: prefix,
            });

            since_checkpoint += 1;
            if since_checkpoint >= cfg.checkpoint_every {
                since_checkpoint = 0;
                self.checkpoint(tracker).await?;
            }
        }
        Ok(())
    }

    async fn checkpoint(&self, tracker: &RunTracker) -> anyhow::Result<()> {
        let cp = tracker.checkpoint(self.pipeline.now()).await;
        self.pipeline.store.save_checkpoint(&cp).await
    }
}
