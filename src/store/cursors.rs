//! Per-folder ingestion cursors. The cursor makes polling resumable
//! across restarts: the provider is only ever asked for UIDs beyond
//! `last_uid`, and `last_uid` only advances after the batch committed.

use crate::models::FolderCursor;
use chrono::Utc;
use rocket_db_pools::sqlx::PgPool;

#[derive(Clone)]
pub struct CursorStore {
    pool: PgPool,
}

impl CursorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Load the cursor for a folder, creating the row on first contact.
    pub async fn load(&self, folder: &str) -> Result<FolderCursor, sqlx::Error> {
        sqlx::query_as::<_, FolderCursor>(
            r#"
            INSERT INTO folder_cursors (folder) VALUES ($1)
            ON CONFLICT (folder) DO UPDATE SET folder = folder_cursors.folder
            RETURNING *
            "#,
        )
        .bind(folder)
        .fetch_one(&self.pool)
        .await
    }

    /// Record a successful poll: advance the high-water mark and clear
    /// the error streak.
    pub async fn advance(
        &self,
        folder: &str,
        last_uid: i64,
        processed: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE folder_cursors
            SET last_uid = GREATEST(last_uid, $2),
                last_poll_at = $3,
                last_success_at = $3,
                last_error = NULL,
                error_count = 0,
                emails_processed = emails_processed + $4
            WHERE folder = $1
            "#,
        )
        .bind(folder)
        .bind(last_uid)
        .bind(Utc::now())
        .bind(processed)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record a failed poll without moving the cursor. Returns the new
    /// error streak, which drives the backoff schedule.
    pub async fn record_error(&self, folder: &str, error: &str) -> Result<i32, sqlx::Error> {
        let (count,): (i32,) = sqlx::query_as(
            r#"
            UPDATE folder_cursors
            SET last_poll_at = $3, last_error = $2, error_count = error_count + 1
            WHERE folder = $1
            RETURNING error_count
            "#,
        )
        .bind(folder)
        .bind(error)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    pub async fn list(&self) -> Result<Vec<FolderCursor>, sqlx::Error> {
        sqlx::query_as::<_, FolderCursor>("SELECT * FROM folder_cursors ORDER BY folder")
            .fetch_all(&self.pool)
            .await
    }
}
