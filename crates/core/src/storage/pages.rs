use crate::domain::page::{url_hash, FetchStatus, WebPage};
use anyhow::Context;
use chrono::{DateTime, Utc};

pub async fn get_page(pool: &sqlx::PgPool, url_hash: &str) -> anyhow::Result<Option<WebPage>> {
    let row = sqlx::query_as::<_, (String, String, Option<String>, String, DateTime<Utc>)>(
        "SELECT url, title, content_hash, fetch_status, fetched_at \
         FROM web_pages \
         WHERE url_hash = $1",
    )
    .bind(url_hash)
    .fetch_optional(pool)
    .await
    .context("select web_pages failed")?;

    let Some((url, title, content_hash, status, fetched_at)) = row else {
        return Ok(None);
    };
    let fetch_status = FetchStatus::parse(&status)
        .with_context(|| format!("unknown fetch_status in DB: {status}"))?;

    Ok(Some(WebPage {
        url,
        title,
        fetched_at,
        content_hash,
        fetch_status,
    }))
}

pub async fn upsert_page(pool: &sqlx::PgPool, page: &WebPage) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO web_pages (url_hash, url, title, content_hash, fetch_status, fetched_at) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (url_hash) DO UPDATE \
           SET url = EXCLUDED.url, \
               title = EXCLUDED.title, \
               content_hash = COALESCE(EXCLUDED.content_hash, web_pages.content_hash), \
               fetch_status = EXCLUDED.fetch_status, \
               fetched_at = EXCLUDED.fetched_at",
    )
    .bind(url_hash(&page.url))
    .bind(&page.url)
    .bind(&page.title)
    .bind(&page.content_hash)
    .bind(page.fetch_status.as_str())
    .bind(page.fetched_at)
    .execute(pool)
    .await
    .context("upsert web_pages failed")?;
    Ok(())
}
