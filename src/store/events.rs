//! Alert event persistence. Events are written once by the parser and
//! never mutated afterwards.

use crate::models::{AlertEvent, AlertState, Severity};
use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx::PgPool;
use serde_json::Value;
use uuid::Uuid;

/// A normalized alert before insertion.
#[derive(Debug, Clone)]
pub struct NewAlertEvent {
    pub raw_email_id: Option<Uuid>,
    pub source_tool: String,
    pub environment: String,
    pub region: String,
    pub host: String,
    pub check_name: String,
    pub service: String,
    pub severity: Severity,
    pub state: AlertState,
    pub occurred_at: DateTime<Utc>,
    pub normalized_signature: String,
    pub fingerprint: String,
    pub content_hash: String,
    pub payload: Value,
    pub tags: Vec<String>,
    pub is_suppressed: bool,
    pub suppression_reason: Option<String>,
}

#[derive(Clone)]
pub struct AlertEventStore {
    pool: PgPool,
}

impl AlertEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, event: &NewAlertEvent) -> Result<AlertEvent, sqlx::Error> {
        sqlx::query_as::<_, AlertEvent>(
            r#"
            INSERT INTO alert_events
                (id, raw_email_id, source_tool, environment, region, host, check_name,
                 service, severity, state, occurred_at, normalized_signature, fingerprint,
                 content_hash, payload, tags, is_suppressed, suppression_reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.raw_email_id)
        .bind(&event.source_tool)
        .bind(&event.environment)
        .bind(&event.region)
        .bind(&event.host)
        .bind(&event.check_name)
        .bind(&event.service)
        .bind(event.severity)
        .bind(event.state)
        .bind(event.occurred_at)
        .bind(&event.normalized_signature)
        .bind(&event.fingerprint)
        .bind(&event.content_hash)
        .bind(&event.payload)
        .bind(&event.tags)
        .bind(event.is_suppressed)
        .bind(&event.suppression_reason)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<AlertEvent>, sqlx::Error> {
        sqlx::query_as::<_, AlertEvent>("SELECT * FROM alert_events WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Events already produced from a raw email. Reprocessing a parsed
    /// email is a no-op when this is non-empty.
    pub async fn for_raw_email(&self, raw_email_id: Uuid) -> Result<Vec<AlertEvent>, sqlx::Error> {
        sqlx::query_as::<_, AlertEvent>(
            "SELECT * FROM alert_events WHERE raw_email_id = $1 ORDER BY occurred_at",
        )
        .bind(raw_email_id)
        .fetch_all(&self.pool)
        .await
    }
}
