use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "IDLE",
            RunState::Running => "RUNNING",
            RunState::Completed => "COMPLETED",
            RunState::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "IDLE" => RunState::Idle,
            "RUNNING" | "STARTED" => RunState::Running,
            "COMPLETED" => RunState::Completed,
            "FAILED" => RunState::Failed,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub queries_planned: u64,
    pub queries_done: u64,
    pub urls_found: u64,
    pub fetched: u64,
    pub unchanged: u64,
    pub extracted: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub persisted: u64,
    pub discarded: u64,
    pub errored: u64,
}

/// Last confirmed position: every URL before `url_index` in query `query_index` is done.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCursor {
    pub query_index: usize,
    pub url_index: usize,
}

/// The single latest run's persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCheckpoint {
    pub run_id: Uuid,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub counts: StageCounts,
    pub cursor: RunCursor,
    /// Hash of the planned query list; resume only applies to the same plan.
    pub plan_fingerprint: String,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: Option<Uuid>,
    pub state: RunState,
    pub counts: StageCounts,
    pub cursor: RunCursor,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub stop_requested: bool,
}

impl RunStatus {
    pub fn idle() -> Self {
        Self {
            run_id: None,
            state: RunState::Idle,
            counts: StageCounts::default(),
            cursor: RunCursor::default(),
            started_at: None,
            finished_at: None,
            last_error: None,
            stop_requested: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRunResponse {
    pub accepted: bool,
    pub current_status: RunStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionRecord {
    pub run_id: Uuid,
    pub page_url: String,
    pub ticker: String,
    pub exchange: Option<String>,
    pub reason: String,
    pub rejected_at: DateTime<Utc>,
}
