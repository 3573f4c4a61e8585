//! Raw email storage. Rows are immutable audit state: content is written
//! once on ingest and only the parse status fields advance afterwards.

use crate::models::{ParseStatus, RawEmail};
use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx::PgPool;
use serde_json::Value;
use uuid::Uuid;

/// A message as handed over by the ingester, before it has a row id.
#[derive(Debug, Clone)]
pub struct NewRawEmail {
    pub folder: String,
    pub uid: i64,
    pub message_id: String,
    pub subject: String,
    pub from_addr: String,
    pub to_addrs: Vec<String>,
    pub date_header: Option<DateTime<Utc>>,
    pub headers: Value,
    pub body_text: String,
    pub body_html: Option<String>,
    pub ics_payload: Option<String>,
    pub attachments: Value,
}

#[derive(Clone)]
pub struct RawEmailStore {
    pool: PgPool,
}

impl RawEmailStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a message, upserting on `(folder, uid)` so a re-poll after
    /// a crash cannot produce a second row. Returns the row id (existing
    /// or new).
    pub async fn upsert(&self, email: &NewRawEmail) -> Result<Uuid, sqlx::Error> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO raw_emails
                (id, folder, uid, message_id, subject, from_addr, to_addrs, date_header,
                 headers, body_text, body_html, ics_payload, attachments)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (folder, uid) DO UPDATE SET folder = raw_emails.folder
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&email.folder)
        .bind(email.uid)
        .bind(&email.message_id)
        .bind(&email.subject)
        .bind(&email.from_addr)
        .bind(&email.to_addrs)
        .bind(email.date_header)
        .bind(&email.headers)
        .bind(&email.body_text)
        .bind(&email.body_html)
        .bind(&email.ics_payload)
        .bind(&email.attachments)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<RawEmail>, sqlx::Error> {
        sqlx::query_as::<_, RawEmail>("SELECT * FROM raw_emails WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Advance the parse status. The transition is monotonic: a row that
    /// already left `pending` is not rewound by a late worker.
    pub async fn set_parse_status(
        &self,
        id: Uuid,
        status: ParseStatus,
        error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE raw_emails SET parse_status = $2, parse_error = $3
            WHERE id = $1 AND (parse_status = 'pending' OR $2 <> 'pending')
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Ids of messages stuck in `pending` longer than the threshold;
    /// used by the reprocess sweeper after a mid-pipeline crash.
    pub async fn stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, sqlx::Error> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM raw_emails
            WHERE parse_status = 'pending' AND received_at < $1
            ORDER BY received_at
            LIMIT $2
            "#,
        )
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
