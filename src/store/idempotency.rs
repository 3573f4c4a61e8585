//! Idempotency key reservations.
//!
//! `begin` is an atomic `INSERT ... ON CONFLICT` claim. A consumer that
//! sees a `processing` reservation older than the stale threshold may
//! reclaim it (the original worker died mid-step); a `completed` key
//! short-circuits with the stored result.

use crate::config::IdempotencyConfig;
use crate::models::IdempotencyStatus;
use chrono::Utc;
use rocket_db_pools::sqlx::PgPool;
use serde_json::Value;

/// Outcome of attempting to claim a key.
#[derive(Debug, Clone, PartialEq)]
pub enum Begin {
    /// The key is ours; run the step and call `complete`.
    Fresh,
    /// Another worker holds a recent reservation.
    InProgress,
    /// The step already ran; the stored result is returned.
    Completed(Option<Value>),
}

#[derive(Clone)]
pub struct IdempotencyStore {
    pool: PgPool,
    config: IdempotencyConfig,
}

impl IdempotencyStore {
    pub fn new(pool: PgPool, config: IdempotencyConfig) -> Self {
        Self { pool, config }
    }

    pub async fn begin(&self, key: &str) -> Result<Begin, sqlx::Error> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(self.config.ttl).unwrap_or(chrono::Duration::zero());

        let inserted: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO idempotency_keys (key, status, expires_at)
            VALUES ($1, 'processing', $2)
            ON CONFLICT (key) DO NOTHING
            RETURNING key
            "#,
        )
        .bind(key)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_some() {
            return Ok(Begin::Fresh);
        }

        let existing: Option<(IdempotencyStatus, Option<Value>)> = sqlx::query_as(
            "SELECT status, result FROM idempotency_keys WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            Some((IdempotencyStatus::Completed, result)) => Ok(Begin::Completed(result)),
            Some((IdempotencyStatus::Processing, _)) => {
                // Reclaim only if the reservation is stale.
                let stale_before = now
                    - chrono::Duration::from_std(self.config.stale_after).unwrap_or(chrono::Duration::zero());
                let reclaimed = sqlx::query(
                    r#"
                    UPDATE idempotency_keys
                    SET updated_at = $2, expires_at = $3
                    WHERE key = $1 AND status = 'processing' AND updated_at < $4
                    "#,
                )
                .bind(key)
                .bind(now)
                .bind(expires_at)
                .bind(stale_before)
                .execute(&self.pool)
                .await?;

                if reclaimed.rows_affected() > 0 {
                    Ok(Begin::Fresh)
                } else {
                    Ok(Begin::InProgress)
                }
            }
            // Raced with the expiry sweeper; try again from scratch.
            None => Ok(Begin::InProgress),
        }
    }

    pub async fn complete(&self, key: &str, result: Option<Value>) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET status = 'completed', result = $2, updated_at = $3
            WHERE key = $1
            "#,
        )
        .bind(key)
        .bind(result)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Drop keys past their TTL. Run periodically by the cleanup
    /// sweeper.
    pub async fn purge_expired(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at < $1")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
