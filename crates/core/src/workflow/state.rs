//! Run lifecycle: `IDLE -> RUNNING -> {COMPLETED, FAILED}`, and a terminal
//! run may be followed by a new `RUNNING` one.

use crate::domain::run::{RunCheckpoint, RunCursor, RunState, RunStatus, StageCounts};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: RunState,
    pub to: RunState,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid run transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

pub fn transition(from: RunState, to: RunState) -> Result<RunState, InvalidTransition> {
    use RunState::*;
    match (from, to) {
        (Idle | Completed | Failed, Running) | (Running, Completed | Failed) => Ok(to),
        _ => Err(InvalidTransition { from, to }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    QueriesDone,
    UrlsFound,
    Fetched,
    Unchanged,
    Extracted,
    Accepted,
    Rejected,
    Persisted,
    Discarded,
    Errored,
}

#[derive(Debug, Default)]
struct Counters {
    queries_planned: AtomicU64,
    queries_done: AtomicU64,
    urls_found: AtomicU64,
    fetched: AtomicU64,
    unchanged: AtomicU64,
    extracted: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    persisted: AtomicU64,
    discarded: AtomicU64,
    errored: AtomicU64,
}

impl Counters {
    fn slot(&self, stage: Stage) -> &AtomicU64 {
        match stage {
            Stage::QueriesDone => &self.queries_done,
            Stage::UrlsFound => &self.urls_found,
            Stage::Fetched => &self.fetched,
            Stage::Unchanged => &self.unchanged,
            Stage::Extracted => &self.extracted,
            Stage::Accepted => &self.accepted,
            Stage::Rejected => &self.rejected,
            Stage::Persisted => &self.persisted,
            Stage::Discarded => &self.discarded,
            Stage::Errored => &self.errored,
        }
    }

    fn snapshot(&self) -> StageCounts {
        let get = |a: &AtomicU64| a.load(Ordering::Relaxed);
        StageCounts {
            queries_planned: get(&self.queries_planned),
            queries_done: get(&self.queries_done),
            urls_found: get(&self.urls_found),
            fetched: get(&self.fetched),
            unchanged: get(&self.unchanged),
            extracted: get(&self.extracted),
            accepted: get(&self.accepted),
            rejected: get(&self.rejected),
            persisted: get(&self.persisted),
            discarded: get(&self.discarded),
            errored: get(&self.errored),
        }
    }
}

#[derive(Debug)]
struct Outcome {
    state: RunState,
    finished_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Live state of one run. Workers only touch the atomic counters; the
/// lifecycle fields are written by the task driving the run.
#[derive(Debug)]
pub struct RunTracker {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub plan_fingerprint: String,
    counters: Counters,
    query_index: AtomicUsize,
    url_index: AtomicUsize,
    stop: AtomicBool,
    outcome: Mutex<Outcome>,
}

impl RunTracker {
    pub fn new(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        plan_fingerprint: String,
        queries_planned: u64,
        start_query: usize,
    ) -> Self {
        let counters = Counters::default();
        counters
            .queries_planned
            .store(queries_planned, Ordering::Relaxed);
        Self {
            run_id,
            started_at,
            plan_fingerprint,
            counters,
            query_index: AtomicUsize::new(start_query),
            url_index: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            outcome: Mutex::new(Outcome {
                state: RunState::Running,
                finished_at: None,
                last_error: None,
            }),
        }
    }

    pub fn incr(&self, stage: Stage) {
        self.add(stage, 1);
    }

    pub fn add(&self, stage: Stage, n: u64) {
        self.counters.slot(stage).fetch_add(n, Ordering::Relaxed);
    }

    pub fn counts(&self) -> StageCounts {
        self.counters.snapshot()
    }

    pub fn set_cursor(&self, cursor: &RunCursor) {
        self.query_index.store(cursor.query_index, Ordering::Relaxed);
        self.url_index.store(cursor.url_index, Ordering::Relaxed);
    }

    pub fn cursor(&self) -> RunCursor {
        RunCursor {
            query_index: self.query_index.load(Ordering::Relaxed),
            url_index: self.url_index.load(Ordering::Relaxed),
        }
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub async fn state(&self) -> RunState {
        self.outcome.lock().await.state
    }

    /// Moves the run to a terminal state. Fails if it already finished.
    pub async fn finish(
        &self,
        to: RunState,
        last_error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        let mut o = self.outcome.lock().await;
        if !to.is_terminal() {
            return Err(InvalidTransition { from: o.state, to });
        }
        o.state = transition(o.state, to)?;
        o.finished_at = Some(at);
        o.last_error = last_error;
        Ok(())
    }

    pub async fn status(&self) -> RunStatus {
        let o = self.outcome.lock().await;
        RunStatus {
            run_id: Some(self.run_id),
            state: o.state,
            counts: self.counts(),
            cursor: self.cursor(),
            started_at: Some(self.started_at),
            finished_at: o.finished_at,
            last_error: o.last_error.clone(),
            stop_requested: self.stop_requested(),
        }
    }

    pub async fn checkpoint(&self, now: DateTime<Utc>) -> RunCheckpoint {
        let o = self.outcome.lock().await;
        RunCheckpoint {
            run_id: self.run_id,
            state: o.state,
            started_at: self.started_at,
            updated_at: now,
            counts: self.counts(),
            cursor: self.cursor(),
            plan_fingerprint: self.plan_fingerprint.clone(),
            last_error: o.last_error.clone(),
        }
    }
}

/// Status for a run this process is not driving, as last checkpointed.
pub fn status_from_checkpoint(cp: RunCheckpoint) -> RunStatus {
    let finished_at = cp.state.is_terminal().then_some(cp.updated_at);
    RunStatus {
        run_id: Some(cp.run_id),
        state: cp.state,
        counts: cp.counts,
        cursor: cp.cursor,
        started_at: Some(cp.started_at),
        finished_at,
        last_error: cp.last_error,
        stop_requested: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tracker() -> RunTracker {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 11, 9, 0, 0).unwrap();
        RunTracker::new(Uuid::new_v4(), t0, "fp".to_string(), 4, 0)
    }

    #[test]
    fn allowed_transitions() {
        use RunState::*;
        assert_eq!(transition(Idle, Running), Ok(Running));
        assert_eq!(transition(Running, Completed), Ok(Completed));
        assert_eq!(transition(Running, Failed), Ok(Failed));
        assert_eq!(transition(Completed, Running), Ok(Running));
        assert_eq!(transition(Failed, Running), Ok(Running));
    }

    #[test]
    fn rejected_transitions() {
        use RunState::*;
        assert!(transition(Idle, Completed).is_err());
        assert!(transition(Running, Running).is_err());
        assert!(transition(Completed, Failed).is_err());
        assert!(transition(Running, Idle).is_err());
    }

    #[tokio::test]
    async fn finish_is_one_shot() {
        let t = tracker();
        let at = Utc::now();
        assert_eq!(t.state().await, RunState::Running);
        t.finish(RunState::Completed, None, at).await.unwrap();
        assert!(t.finish(RunState::Failed, None, at).await.is_err());

        let s = t.status().await;
        assert_eq!(s.state, RunState::Completed);
        assert_eq!(s.finished_at, Some(at));
    }

    #[tokio::test]
    async fn counters_are_shared_across_tasks() {
        let t = std::sync::Arc::new(tracker());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let t = t.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    t.incr(Stage::Fetched);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let counts = t.counts();
        assert_eq!(counts.fetched, 800);
        assert_eq!(counts.queries_planned, 4);
    }

    #[tokio::test]
    async fn checkpoint_carries_cursor_and_error() {
        let t = tracker();
        t.set_cursor(&RunCursor {
            query_index: 2,
            url_index: 3,
        });
        t.finish(RunState::Failed, Some("db down".to_string()), Utc::now())
            .await
            .unwrap();
        let cp = t.checkpoint(Utc::now()).await;
        assert_eq!(cp.state, RunState::Failed);
        assert_eq!(cp.cursor.query_index, 2);
        assert_eq!(cp.last_error.as_deref(), Some("db down"));

        let s = status_from_checkpoint(cp);
        assert!(s.finished_at.is_some());
        assert!(!s.stop_requested);
    }
}
