//! Learned-pattern cache keyed by format signature.
//!
//! The cache is shared and read-mostly; statistics updates use plain
//! row-level UPDATEs. The success rate is an exponentially weighted
//! average so one bad sample does not evict a long-lived pattern.

use crate::models::{ExtractionType, PatternCacheEntry};
use chrono::Utc;
use rocket_db_pools::sqlx::PgPool;
use serde_json::Value;
use uuid::Uuid;

/// Weight of one new sample in the success-rate EWMA.
const SUCCESS_RATE_WEIGHT: f64 = 0.05;

#[derive(Clone)]
pub struct PatternCacheStore {
    pool: PgPool,
}

impl PatternCacheStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn lookup(
        &self,
        signature_hash: &str,
    ) -> Result<Option<PatternCacheEntry>, sqlx::Error> {
        sqlx::query_as::<_, PatternCacheEntry>(
            "SELECT * FROM pattern_cache WHERE signature_hash = $1",
        )
        .bind(signature_hash)
        .fetch_optional(&self.pool)
        .await
    }

    /// Insert a freshly learned rule set. On a signature collision the
    /// existing row wins (another worker learned it first) and is
    /// returned instead.
    pub async fn insert_learned(
        &self,
        signature_hash: &str,
        from_domain: &str,
        subject_prefix: &str,
        body_markers: &[String],
        source_name: &str,
        extraction_rules: &Value,
        created_from_email_id: Option<Uuid>,
    ) -> Result<PatternCacheEntry, sqlx::Error> {
        let inserted = sqlx::query_as::<_, PatternCacheEntry>(
            r#"
            INSERT INTO pattern_cache
                (id, signature_hash, from_domain, subject_prefix, body_markers, source_name,
                 extraction_rules, match_count, success_rate, is_approved, created_from_email_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 1, 100.0, FALSE, $8)
            ON CONFLICT (signature_hash) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(signature_hash)
        .bind(from_domain)
        .bind(subject_prefix)
        .bind(body_markers)
        .bind(source_name)
        .bind(extraction_rules)
        .bind(created_from_email_id)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(entry) => Ok(entry),
            None => {
                let existing = self.lookup(signature_hash).await?;
                existing.ok_or(sqlx::Error::RowNotFound)
            }
        }
    }

    /// Record a successful cache application.
    pub async fn record_hit(&self, signature_hash: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE pattern_cache
            SET match_count = match_count + 1,
                last_matched_at = $2,
                success_rate = success_rate + $3 * (100.0 - success_rate)
            WHERE signature_hash = $1
            "#,
        )
        .bind(signature_hash)
        .bind(Utc::now())
        .bind(SUCCESS_RATE_WEIGHT)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record an application whose output later failed validation.
    pub async fn record_failure(&self, signature_hash: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE pattern_cache
            SET success_rate = success_rate + $2 * (0.0 - success_rate)
            WHERE signature_hash = $1
            "#,
        )
        .bind(signature_hash)
        .bind(SUCCESS_RATE_WEIGHT)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append one audit row per cache or LLM consultation.
    pub async fn log_extraction(
        &self,
        raw_email_id: Option<Uuid>,
        signature_hash: Option<&str>,
        extraction_type: ExtractionType,
        parser_name: Option<&str>,
        confidence: Option<f64>,
        succeeded: bool,
        detail: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO pattern_extraction_log
                (id, raw_email_id, signature_hash, extraction_type, parser_name,
                 confidence, succeeded, detail)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(raw_email_id)
        .bind(signature_hash)
        .bind(extraction_type)
        .bind(parser_name)
        .bind(confidence)
        .bind(succeeded)
        .bind(detail)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// EWMA update used by the store; factored out for unit testing.
pub fn ewma(current: f64, sample: f64, weight: f64) -> f64 {
    current + weight * (sample - current)
}
