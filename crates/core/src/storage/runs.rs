use crate::domain::run::{RunCheckpoint, RunCursor, RunState, StageCounts};
use anyhow::Context;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Overwrites the single checkpoint row.
pub async fn save_checkpoint(pool: &sqlx::PgPool, cp: &RunCheckpoint) -> anyhow::Result<()> {
    let counts = serde_json::to_value(&cp.counts).context("serialize counts failed")?;
    let query_index = i32::try_from(cp.cursor.query_index).context("query_index overflow")?;
    let url_index = i32::try_from(cp.cursor.url_index).context("url_index overflow")?;

    sqlx::query(
        "INSERT INTO workflow_checkpoints \
           (id, run_id, state, started_at, updated_at, counts, query_index, url_index, plan_fingerprint, last_error) \
         VALUES (1, $1, $2, $3, $4, $5, $6, $7, $8, $9) \
         ON CONFLICT (id) DO UPDATE \
           SET run_id = EXCLUDED.run_id, \
               state = EXCLUDED.state, \
               started_at = EXCLUDED.started_at, \
               updated_at = EXCLUDED.updated_at, \
               counts = EXCLUDED.counts, \
               query_index = EXCLUDED.query_index, \
               url_index = EXCLUDED.url_index, \
               plan_fingerprint = EXCLUDED.plan_fingerprint, \
               last_error = EXCLUDED.last_error",
    )
    .persistent(false)
    .bind(cp.run_id)
    .bind(cp.state.as_str())
    .bind(cp.started_at)
    .bind(cp.updated_at)
    .bind(counts)
    .bind(query_index)
    .bind(url_index)
    .bind(&cp.plan_fingerprint)
    .bind(&cp.last_error)
    .execute(pool)
    .await
    .context("upsert workflow_checkpoints failed")?;
    Ok(())
}

type CheckpointRow = (
    Uuid,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
    serde_json::Value,
    i32,
    i32,
    String,
    Option<String>,
);

pub async fn load_checkpoint(pool: &sqlx::PgPool) -> anyhow::Result<Option<RunCheckpoint>> {
    let row = sqlx::query_as::<_, CheckpointRow>(
        "SELECT run_id, state, started_at, updated_at, counts, query_index, url_index, plan_fingerprint, last_error \
         FROM workflow_checkpoints \
         WHERE id = 1",
    )
    .persistent(false)
    .fetch_optional(pool)
    .await
    .context("select workflow_checkpoints failed")?;

    let Some((
        run_id,
        state,
        started_at,
        updated_at,
        counts,
        query_index,
        url_index,
        plan_fingerprint,
        last_error,
    )) = row
    else {
        return Ok(None);
    };

    let state =
        RunState::parse(&state).with_context(|| format!("unknown run state in DB: {state}"))?;
    let counts: StageCounts = serde_json::from_value(counts).context("decode counts failed")?;

    Ok(Some(RunCheckpoint {
        run_id,
        state,
        started_at,
        updated_at,
        counts,
        cursor: RunCursor {
            query_index: usize::try_from(query_index).context("negative query_index")?,
            url_index: usize::try_from(url_index).context("negative url_index")?,
        },
        plan_fingerprint,
        last_error,
    }))
}
