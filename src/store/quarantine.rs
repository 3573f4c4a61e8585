//! Quarantine queue: low-confidence or invalid extractions held for
//! human review.

use crate::models::{QuarantineEvent, ReviewOutcome};
use chrono::Utc;
use rocket_db_pools::sqlx::PgPool;
use serde_json::Value;
use uuid::Uuid;

#[derive(Clone)]
pub struct QuarantineStore {
    pool: PgPool,
}

impl QuarantineStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn push(
        &self,
        raw_email_id: Uuid,
        signature_hash: Option<&str>,
        candidate: Value,
        confidence: f64,
        reason: &str,
    ) -> Result<Uuid, sqlx::Error> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO quarantine_events
                (id, raw_email_id, signature_hash, candidate, confidence, reason)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(raw_email_id)
        .bind(signature_hash)
        .bind(candidate)
        .bind(confidence)
        .bind(reason)
        .fetch_one(&self.pool)
        .await?;

        log::info!("quarantined email {} ({})", raw_email_id, reason);
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<QuarantineEvent>, sqlx::Error> {
        sqlx::query_as::<_, QuarantineEvent>("SELECT * FROM quarantine_events WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Record a review decision. Only unreviewed entries accept one.
    pub async fn review(&self, id: Uuid, outcome: ReviewOutcome) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE quarantine_events
            SET review_outcome = $2, reviewed_at = $3
            WHERE id = $1 AND review_outcome IS NULL
            "#,
        )
        .bind(id)
        .bind(outcome)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_unreviewed(
        &self,
        page: i64,
        size: i64,
    ) -> Result<(Vec<QuarantineEvent>, i64), sqlx::Error> {
        let page = page.max(1);
        let size = size.clamp(1, 100);
        let offset = (page - 1) * size;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM quarantine_events WHERE review_outcome IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;

        let entries = sqlx::query_as::<_, QuarantineEvent>(
            r#"
            SELECT * FROM quarantine_events WHERE review_outcome IS NULL
            ORDER BY created_at DESC LIMIT $1 OFFSET $2
            "#,
        )
        .bind(size)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok((entries, total))
    }
}
