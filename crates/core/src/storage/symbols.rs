use crate::planner::Target;
use crate::symbols::master::MasterRecord;
use crate::symbols::{normalize_exchange, CompanyInfo, ReferenceSymbolDirectory};
use anyhow::Context;

/// Replaces listings from an imported master file. Existing rows keep their
/// `tracked` flag unless `mark_tracked` is set.
pub async fn import_symbols(
    pool: &sqlx::PgPool,
    records: &[MasterRecord],
    mark_tracked: bool,
) -> anyhow::Result<u64> {
    anyhow::ensure!(!records.is_empty(), "records must be non-empty");

    // One statement may not touch the same conflict key twice; last row wins.
    let mut by_key: std::collections::BTreeMap<(String, String), &MasterRecord> =
        std::collections::BTreeMap::new();
    for r in records {
        let key = (
            r.info.ticker.trim().to_ascii_uppercase(),
            normalize_exchange(&r.info.exchange),
        );
        by_key.insert(key, r);
    }
    let rows: Vec<(&(String, String), &MasterRecord)> =
        by_key.iter().map(|(k, r)| (k, *r)).collect();

    let mut tx = pool.begin().await.context("begin transaction failed")?;

    let mut affected: u64 = 0;
    let chunk_size: usize = std::env::var("SYMBOLS_UPSERT_BATCH")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(500);

    anyhow::ensure!(chunk_size >= 1, "SYMBOLS_UPSERT_BATCH must be >= 1");

    for (batch_idx, chunk) in rows.chunks(chunk_size).enumerate() {
        let t0 = std::time::Instant::now();
        let mut qb = sqlx::QueryBuilder::<sqlx::Postgres>::new(
            "INSERT INTO reference_symbols (ticker, exchange, company_name, mic, tracked, updated_at) ",
        );
        qb.push_values(chunk, |mut b, ((ticker, exchange), r)| {
            b.push_bind(ticker.clone())
                .push_bind(exchange.clone())
                .push_bind(r.info.company_name.trim().to_string())
                .push_bind(r.info.mic.clone())
                .push_bind(r.tracked || mark_tracked)
                .push("now()");
        });
        qb.push(
            " ON CONFLICT (ticker, exchange) DO UPDATE \
               SET company_name = EXCLUDED.company_name, \
                   mic = EXCLUDED.mic, \
                   tracked = reference_symbols.tracked OR EXCLUDED.tracked, \
                   updated_at = EXCLUDED.updated_at",
        );

        let res = qb
            .build()
            .persistent(false)
            .execute(&mut *tx)
            .await
            .context("batch upsert reference_symbols failed")?;
        affected += res.rows_affected();

        tracing::debug!(
            batch_idx,
            batch_size = chunk.len(),
            elapsed_ms = t0.elapsed().as_millis(),
            "reference_symbols batch upsert"
        );
    }

    tx.commit().await.context("commit transaction failed")?;
    Ok(affected)
}

/// Companies the planner should always query for.
pub async fn tracked_targets(pool: &sqlx::PgPool) -> anyhow::Result<Vec<Target>> {
    let rows = sqlx::query_as::<_, (String, String, String)>(
        "SELECT ticker, exchange, company_name \
         FROM reference_symbols \
         WHERE tracked \
         ORDER BY exchange ASC, ticker ASC",
    )
    .persistent(false)
    .fetch_all(pool)
    .await
    .context("select tracked reference_symbols failed")?;

    Ok(rows
        .into_iter()
        .map(|(ticker, exchange, name)| Target::new(&ticker, &exchange, &name))
        .collect())
}

pub struct PgSymbolDirectory {
    pool: sqlx::PgPool,
}

impl PgSymbolDirectory {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn count(&self) -> anyhow::Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT count(*) FROM reference_symbols")
            .persistent(false)
            .fetch_one(&self.pool)
            .await
            .context("count reference_symbols failed")?;
        Ok(n)
    }
}

#[async_trait::async_trait]
impl ReferenceSymbolDirectory for PgSymbolDirectory {
    async fn listings(&self, ticker: &str) -> anyhow::Result<Vec<CompanyInfo>> {
        let rows = sqlx::query_as::<_, (String, String, String, Option<String>)>(
            "SELECT ticker, exchange, company_name, mic \
             FROM reference_symbols \
             WHERE ticker = $1",
        )
        .persistent(false)
        .bind(ticker.trim().to_ascii_uppercase())
        .fetch_all(&self.pool)
        .await
        .context("select reference_symbols failed")?;

        Ok(rows
            .into_iter()
            .map(|(ticker, exchange, company_name, mic)| CompanyInfo {
                ticker,
                exchange,
                company_name,
                mic,
            })
            .collect())
    }
}
