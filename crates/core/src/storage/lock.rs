use anyhow::Context;
use sqlx::pool::PoolConnection;
use sqlx::Postgres;
use tokio::sync::Mutex;

// Advisory locks are scoped to the Postgres session, so the lock lives on a
// connection taken out of the pool for the whole run.
const LOCK_NAMESPACE: i64 = 0x5354_4F43_4B52; // "STOCKR"
const RUN_LOCK_KEY: i64 = LOCK_NAMESPACE ^ 0x5255_4E;

/// Holds the session that owns the pipeline run lock, if any.
#[derive(Default)]
pub struct RunLockSlot {
    conn: Mutex<Option<PoolConnection<Postgres>>>,
}

impl RunLockSlot {
    pub async fn try_acquire(&self, pool: &sqlx::PgPool) -> anyhow::Result<bool> {
        let mut slot = self.conn.lock().await;
        if slot.is_some() {
            // This process already holds it.
            return Ok(false);
        }

        let mut conn = pool
            .acquire()
            .await
            .context("failed to acquire connection for run lock")?;
        let acquired: (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
            .persistent(false)
            .bind(RUN_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await
            .with_context(|| format!("failed to acquire advisory lock (key={RUN_LOCK_KEY})"))?;

        if acquired.0 {
            *slot = Some(conn);
        }
        Ok(acquired.0)
    }

    pub async fn release(&self) -> anyhow::Result<()> {
        let Some(mut conn) = self.conn.lock().await.take() else {
            return Ok(());
        };
        let res = sqlx::query("SELECT pg_advisory_unlock($1)")
            .persistent(false)
            .bind(RUN_LOCK_KEY)
            .execute(&mut *conn)
            .await;
        if let Err(err) = res {
            // The lock belongs to the session; closing it is the only other way out.
            if let Err(close_err) = conn.close().await {
                tracing::warn!(error = %close_err, "close run lock connection failed");
            }
            return Err(anyhow::Error::new(err)
                .context(format!("failed to release advisory lock (key={RUN_LOCK_KEY})")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pool() -> Option<sqlx::PgPool> {
        let url = std::env::var("DATABASE_URL").ok()?;
        sqlx::postgres::PgPoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await
            .ok()
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL"]
    async fn lock_is_exclusive_across_sessions() {
        let Some(pool) = pool().await else {
            return;
        };
        let a = RunLockSlot::default();
        let b = RunLockSlot::default();

        assert!(a.try_acquire(&pool).await.unwrap());
        assert!(!a.try_acquire(&pool).await.unwrap());
        assert!(!b.try_acquire(&pool).await.unwrap());

        a.release().await.unwrap();
        assert!(b.try_acquire(&pool).await.unwrap());
        b.release().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL"]
    async fn failed_unlock_does_not_leak_the_lock() {
        let Some(pool) = pool().await else {
            return;
        };
        let a = RunLockSlot::default();
        assert!(a.try_acquire(&pool).await.unwrap());

        // Kill the holding session so the unlock statement fails.
        sqlx::query(
            "SELECT pg_terminate_backend(pid) FROM pg_locks \
             WHERE locktype = 'advisory' AND pid <> pg_backend_pid()",
        )
        .persistent(false)
        .execute(&pool)
        .await
        .unwrap();

        assert!(a.release().await.is_err());

        let b = RunLockSlot::default();
        assert!(b.try_acquire(&pool).await.unwrap());
        b.release().await.unwrap();
    }
}
