use crate::domain::page::RawExtraction;
use crate::domain::run::RejectionRecord;
use anyhow::Context;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Append-only. Raw model output is never updated after insert.
pub async fn insert_raw_extraction(pool: &sqlx::PgPool, raw: &RawExtraction) -> anyhow::Result<()> {
    let parse_status = serde_json::to_value(&raw.parse_status).context("serialize parse_status failed")?;

    sqlx::query(
        "INSERT INTO raw_extractions (id, run_id, page_url, provider, raw_output, parse_status, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .persistent(false)
    .bind(raw.id)
    .bind(raw.run_id)
    .bind(&raw.page_url)
    .bind(&raw.provider)
    .bind(&raw.raw_output)
    .bind(parse_status)
    .bind(raw.created_at)
    .execute(pool)
    .await
    .context("insert raw_extractions failed")?;
    Ok(())
}

pub async fn insert_rejection(pool: &sqlx::PgPool, r: &RejectionRecord) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO candidate_rejections (run_id, page_url, ticker, exchange, reason, rejected_at) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .persistent(false)
    .bind(r.run_id)
    .bind(&r.page_url)
    .bind(&r.ticker)
    .bind(&r.exchange)
    .bind(&r.reason)
    .bind(r.rejected_at)
    .execute(pool)
    .await
    .context("insert candidate_rejections failed")?;
    Ok(())
}

/// Oldest first.
pub async fn list_rejections(
    pool: &sqlx::PgPool,
    run_id: Uuid,
    limit: i64,
) -> anyhow::Result<Vec<RejectionRecord>> {
    let rows = sqlx::query_as::<_, (String, String, Option<String>, String, DateTime<Utc>)>(
        "SELECT page_url, ticker, exchange, reason, rejected_at \
         FROM candidate_rejections \
         WHERE run_id = $1 \
         ORDER BY id ASC \
         LIMIT $2",
    )
    .persistent(false)
    .bind(run_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("select candidate_rejections failed")?;

    Ok(rows
        .into_iter()
        .map(
            |(page_url, ticker, exchange, reason, rejected_at)| RejectionRecord {
                run_id,
                page_url,
                ticker,
                exchange,
                reason,
                rejected_at,
            },
        )
        .collect())
}
