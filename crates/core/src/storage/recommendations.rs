use crate::dedup::{self, DedupDecision};
use crate::domain::recommendation::{
    PersistedRecommendation, RecommendationQuery, RecommendationSort, ScoreFactors,
    ScoredCandidate,
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

const COLUMNS: &str = "id, dedup_key, ticker, exchange, company_name, rating, price, fair_price, \
     target_price, growth_forecast_pct, pe, reasoning, analyst, source_span, analysis_date, \
     source_url, quality_score, quality_factors, extracted_at, updated_at";

pub async fn get_by_key(
    pool: &sqlx::PgPool,
    dedup_key: &str,
) -> anyhow::Result<Option<PersistedRecommendation>> {
    let mut conn = pool.acquire().await.context("acquire connection failed")?;
    fetch_by_key(&mut *conn, dedup_key).await
}

async fn fetch_by_key(
    conn: &mut sqlx::PgConnection,
    dedup_key: &str,
) -> anyhow::Result<Option<PersistedRecommendation>> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM recommendations WHERE dedup_key = $1"
    ))
    .persistent(false)
    .bind(dedup_key)
    .fetch_optional(&mut *conn)
    .await
    .context("select recommendations by dedup_key failed")?;

    row.as_ref().map(from_row).transpose()
}

/// Reads, decides and writes under a transaction-scoped advisory lock on the
/// dedup key, so concurrent workers never both insert the same key.
pub async fn apply_scored(
    pool: &sqlx::PgPool,
    scored: &ScoredCandidate,
    now: DateTime<Utc>,
) -> anyhow::Result<DedupDecision> {
    let key = scored.dedup_key().as_storage_key();
    let mut tx = pool.begin().await.context("begin transaction failed")?;

    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .persistent(false)
        .bind(&key)
        .execute(&mut *tx)
        .await
        .context("dedup key lock failed")?;

    let existing = fetch_by_key(&mut *tx, &key).await?;
    let decision = dedup::decide(scored, existing.as_ref());

    match (decision, existing) {
        (DedupDecision::Insert, _) => {
            let rec = PersistedRecommendation::from_scored(Uuid::new_v4(), scored, now);
            insert(&mut *tx, &rec).await?;
        }
        (DedupDecision::Replace, Some(old)) => {
            let rec = PersistedRecommendation::from_scored(old.id, scored, now);
            update(&mut *tx, &rec).await?;
        }
        (DedupDecision::Replace, None) => {
            anyhow::bail!("dedup replace without existing record (key={key})");
        }
        (DedupDecision::Discard, _) => {}
    }

    tx.commit().await.context("commit transaction failed")?;
    Ok(decision)
}

async fn insert(conn: &mut sqlx::PgConnection, rec: &PersistedRecommendation) -> anyhow::Result<()> {
    let factors =
        serde_json::to_value(&rec.quality_factors).context("serialize quality_factors failed")?;

    sqlx::query(&format!(
        "INSERT INTO recommendations ({COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)"
    ))
    .persistent(false)
    .bind(rec.id)
    .bind(&rec.dedup_key)
    .bind(&rec.ticker)
    .bind(&rec.exchange)
    .bind(&rec.company_name)
    .bind(rec.rating)
    .bind(rec.price)
    .bind(rec.fair_price)
    .bind(rec.target_price)
    .bind(rec.growth_forecast_pct)
    .bind(rec.pe)
    .bind(&rec.reasoning)
    .bind(&rec.analyst)
    .bind(&rec.source_span)
    .bind(rec.analysis_date)
    .bind(&rec.source_url)
    .bind(rec.quality_score)
    .bind(factors)
    .bind(rec.extracted_at)
    .bind(rec.updated_at)
    .execute(&mut *conn)
    .await
    .context("insert recommendations failed")?;
    Ok(())
}

async fn update(conn: &mut sqlx::PgConnection, rec: &PersistedRecommendation) -> anyhow::Result<()> {
    let factors =
        serde_json::to_value(&rec.quality_factors).context("serialize quality_factors failed")?;

    sqlx::query(
        "UPDATE recommendations \
           SET ticker = $2, exchange = $3, company_name = $4, rating = $5, price = $6, \
               fair_price = $7, target_price = $8, growth_forecast_pct = $9, pe = $10, \
               reasoning = $11, analyst = $12, source_span = $13, quality_score = $14, \
               quality_factors = $15, extracted_at = $16, updated_at = $17 \
         WHERE id = $1",
    )
    .persistent(false)
    .bind(rec.id)
    .bind(&rec.ticker)
    .bind(&rec.exchange)
    .bind(&rec.company_name)
    .bind(rec.rating)
    .bind(rec.price)
    .bind(rec.fair_price)
    .bind(rec.target_price)
    .bind(rec.growth_forecast_pct)
    .bind(rec.pe)
    .bind(&rec.reasoning)
    .bind(&rec.analyst)
    .bind(&rec.source_span)
    .bind(rec.quality_score)
    .bind(factors)
    .bind(rec.extracted_at)
    .bind(rec.updated_at)
    .execute(&mut *conn)
    .await
    .context("update recommendations failed")?;
    Ok(())
}

pub async fn list(
    pool: &sqlx::PgPool,
    query: &RecommendationQuery,
) -> anyhow::Result<Vec<PersistedRecommendation>> {
    let mut qb = sqlx::QueryBuilder::<sqlx::Postgres>::new(format!(
        "SELECT {COLUMNS} FROM recommendations WHERE TRUE"
    ));

    if let Some(ticker) = &query.ticker {
        qb.push(" AND ticker = ")
            .push_bind(ticker.trim().to_ascii_uppercase());
    }
    if let Some(exchange) = &query.exchange {
        qb.push(" AND upper(exchange) = ")
            .push_bind(exchange.trim().to_ascii_uppercase());
    }
    if let Some(min) = query.min_score {
        qb.push(" AND quality_score >= ").push_bind(min);
    }
    if let Some(since) = query.since {
        qb.push(" AND analysis_date >= ").push_bind(since);
    }

    qb.push(match query.sort {
        RecommendationSort::Score => " ORDER BY quality_score DESC, extracted_at DESC",
        RecommendationSort::Date => " ORDER BY analysis_date DESC NULLS LAST, quality_score DESC",
        RecommendationSort::Ticker => " ORDER BY ticker ASC, quality_score DESC",
    });
    qb.push(" LIMIT ").push_bind(query.effective_limit());

    let rows = qb
        .build()
        .persistent(false)
        .fetch_all(pool)
        .await
        .context("select recommendations failed")?;

    rows.iter().map(from_row).collect()
}

fn from_row(row: &PgRow) -> anyhow::Result<PersistedRecommendation> {
    let factors: serde_json::Value = row.try_get("quality_factors")?;
    let quality_factors: ScoreFactors =
        serde_json::from_value(factors).context("decode quality_factors failed")?;

    Ok(PersistedRecommendation {
        id: row.try_get("id")?,
        dedup_key: row.try_get("dedup_key")?,
        ticker: row.try_get("ticker")?,
        exchange: row.try_get("exchange")?,
        company_name: row.try_get("company_name")?,
        rating: row.try_get("rating")?,
        price: row.try_get("price")?,
        fair_price: row.try_get("fair_price")?,
        target_price: row.try_get("target_price")?,
        growth_forecast_pct: row.try_get("growth_forecast_pct")?,
        pe: row.try_get("pe")?,
        reasoning: row.try_get("reasoning")?,
        analyst: row.try_get("analyst")?,
        source_span: row.try_get("source_span")?,
        analysis_date: row.try_get("analysis_date")?,
        source_url: row.try_get("source_url")?,
        quality_score: row.try_get("quality_score")?,
        quality_factors,
        extracted_at: row.try_get("extracted_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
