//! Dead-letter queue: the retry buffer for transient failures that
//! exhausted local retries. Entries are claimed with a skip-locked
//! select so multiple sweeper workers cooperate safely.

use crate::config::DlqConfig;
use crate::models::{DeadLetterEntry, DeadLetterStatus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use rocket_db_pools::sqlx::PgPool;
use serde_json::Value;
use uuid::Uuid;

#[derive(Clone)]
pub struct DeadLetterStore {
    pool: PgPool,
    config: DlqConfig,
}

impl DeadLetterStore {
    pub fn new(pool: PgPool, config: DlqConfig) -> Self {
        Self { pool, config }
    }

    /// Park a failed step with its original payload.
    pub async fn push(
        &self,
        event_type: &str,
        payload: Value,
        error: &str,
    ) -> Result<Uuid, sqlx::Error> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO dead_letters (id, event_type, payload, error, max_retries, next_retry_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event_type)
        .bind(payload)
        .bind(error)
        .bind(self.config.max_retries)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        log::warn!("dead-lettered {} entry {}: {}", event_type, id, error);
        Ok(id)
    }

    /// Claim up to `limit` due entries and mark them `retrying`. The
    /// `FOR UPDATE SKIP LOCKED` select lets concurrent sweepers divide
    /// the backlog without blocking each other.
    pub async fn claim_due(&self, limit: i64) -> Result<Vec<DeadLetterEntry>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let entries = sqlx::query_as::<_, DeadLetterEntry>(
            r#"
            SELECT * FROM dead_letters
            WHERE status = 'pending' AND next_retry_at <= $1 AND retry_count < max_retries
            ORDER BY next_retry_at
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(Utc::now())
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        for entry in &entries {
            sqlx::query(
                "UPDATE dead_letters SET status = 'retrying', updated_at = $2 WHERE id = $1",
            )
            .bind(entry.id)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(entries)
    }

    pub async fn mark_resolved(&self, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE dead_letters SET status = 'resolved', updated_at = $2 WHERE id = $1")
            .bind(id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Record a failed retry: bump the counter and either reschedule
    /// with jittered exponential backoff or park the entry as `failed`.
    pub async fn mark_retry_failed(&self, entry: &DeadLetterEntry, error: &str) -> Result<(), sqlx::Error> {
        let retry_count = entry.retry_count + 1;

        if retry_count >= entry.max_retries {
            sqlx::query(
                r#"
                UPDATE dead_letters
                SET status = 'failed', retry_count = $2, error = $3, updated_at = $4
                WHERE id = $1
                "#,
            )
            .bind(entry.id)
            .bind(retry_count)
            .bind(error)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

            log::error!(
                "dead letter {} exhausted {} retries: {}",
                entry.id,
                entry.max_retries,
                error
            );
            return Ok(());
        }

        let next_retry_at = self.next_retry_at(retry_count);
        sqlx::query(
            r#"
            UPDATE dead_letters
            SET status = 'pending', retry_count = $2, error = $3,
                next_retry_at = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(entry.id)
        .bind(retry_count)
        .bind(error)
        .bind(next_retry_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// `now + min(cap, base * 2^retry_count) ± 20%`.
    fn next_retry_at(&self, retry_count: i32) -> DateTime<Utc> {
        let delay = backoff_delay_secs(
            self.config.base_backoff.as_secs_f64(),
            self.config.cap_backoff.as_secs_f64(),
            retry_count,
        );
        let jitter = rand::thread_rng().gen_range(-0.2..=0.2);
        let jittered = delay * (1.0 + jitter);
        Utc::now() + ChronoDuration::milliseconds((jittered * 1000.0) as i64)
    }

    /// Make an explicitly re-dispatched entry due immediately, with a
    /// fresh retry budget.
    pub async fn redispatch(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE dead_letters
            SET status = 'pending', retry_count = 0, next_retry_at = $2, updated_at = $2
            WHERE id = $1 AND status IN ('pending', 'retrying', 'failed')
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list(
        &self,
        statuses: &[DeadLetterStatus],
        page: i64,
        size: i64,
    ) -> Result<(Vec<DeadLetterEntry>, i64), sqlx::Error> {
        let page = page.max(1);
        let size = size.clamp(1, 100);
        let offset = (page - 1) * size;

        let (entries, total) = if statuses.is_empty() {
            let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
                .fetch_one(&self.pool)
                .await?;
            let entries = sqlx::query_as::<_, DeadLetterEntry>(
                "SELECT * FROM dead_letters ORDER BY created_at DESC LIMIT $1 OFFSET $2",
            )
            .bind(size)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
            (entries, total)
        } else {
            let total: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters WHERE status = ANY($1)")
                    .bind(statuses)
                    .fetch_one(&self.pool)
                    .await?;
            let entries = sqlx::query_as::<_, DeadLetterEntry>(
                r#"
                SELECT * FROM dead_letters WHERE status = ANY($1)
                ORDER BY created_at DESC LIMIT $2 OFFSET $3
                "#,
            )
            .bind(statuses)
            .bind(size)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
            (entries, total)
        };

        Ok((entries, total))
    }
}

/// Exponential backoff without jitter, capped.
pub fn backoff_delay_secs(base: f64, cap: f64, retry_count: i32) -> f64 {
    let exp = 2f64.powi(retry_count.min(30));
    (base * exp).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        assert_eq!(backoff_delay_secs(30.0, 3600.0, 0), 30.0);
        assert_eq!(backoff_delay_secs(30.0, 3600.0, 1), 60.0);
        assert_eq!(backoff_delay_secs(30.0, 3600.0, 3), 240.0);
        assert_eq!(backoff_delay_secs(30.0, 3600.0, 10), 3600.0);
    }

    #[test]
    fn backoff_survives_large_retry_counts() {
        assert_eq!(backoff_delay_secs(30.0, 3600.0, 1000), 3600.0);
    }
}
