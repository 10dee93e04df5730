use crate::domain::page::DomainPolicy;
use anyhow::Context;
use chrono::{DateTime, Utc};

pub async fn get_policy(pool: &sqlx::PgPool, domain: &str) -> anyhow::Result<Option<DomainPolicy>> {
    let row = sqlx::query_as::<_, (bool, bool, DateTime<Utc>)>(
        "SELECT usable, requires_browser, updated_at FROM domain_policies WHERE domain = $1",
    )
    .persistent(false)
    .bind(domain)
    .fetch_optional(pool)
    .await
    .context("select domain_policies failed")?;

    Ok(row.map(|(usable, requires_browser, updated_at)| DomainPolicy {
        domain: domain.to_string(),
        usable,
        requires_browser,
        updated_at,
    }))
}

pub async fn upsert_policy(pool: &sqlx::PgPool, policy: &DomainPolicy) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO domain_policies (domain, usable, requires_browser, updated_at) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (domain) DO UPDATE \
           SET usable = EXCLUDED.usable, \
               requires_browser = EXCLUDED.requires_browser, \
               updated_at = EXCLUDED.updated_at",
    )
    .persistent(false)
    .bind(&policy.domain)
    .bind(policy.usable)
    .bind(policy.requires_browser)
    .bind(policy.updated_at)
    .execute(pool)
    .await
    .context("upsert domain_policies failed")?;
    Ok(())
}
