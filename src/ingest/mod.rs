//! Mail ingestion: pull new messages per folder, persist them exactly
//! once, and hand them to the parser queue.
//!
//! Ordering and safety come from three pieces working together: the
//! folder cursor (resume point, advanced only after commit), the
//! `(folder, uid)` upsert on raw emails (re-polls cannot duplicate),
//! and the idempotency key per message (crash between insert and
//! acknowledge is recovered without re-enqueueing).

pub mod graph;
pub mod imap;
pub mod maildir;
pub mod provider;

use crate::store::raw_emails::NewRawEmail;
use crate::store::{Begin, CursorStore, IdempotencyStore, RawEmailStore};
use provider::{FetchedMessage, MailProvider, ProviderError};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("parse queue closed")]
    QueueClosed,
}

/// Counters from one poll pass, for logging and cursor bookkeeping.
#[derive(Debug, Default, Clone, Copy)]
pub struct PollStats {
    pub fetched: usize,
    pub stored: usize,
    pub skipped: usize,
}

pub struct Ingester {
    provider: Arc<dyn MailProvider>,
    cursors: CursorStore,
    raw_emails: RawEmailStore,
    idempotency: IdempotencyStore,
    batch_size: i64,
}

impl Ingester {
    pub fn new(
        provider: Arc<dyn MailProvider>,
        cursors: CursorStore,
        raw_emails: RawEmailStore,
        idempotency: IdempotencyStore,
        batch_size: i64,
    ) -> Self {
        Self {
            provider,
            cursors,
            raw_emails,
            idempotency,
            batch_size,
        }
    }

    /// One poll pass over a folder. On provider failure the cursor is
    /// not advanced and the error streak grows; the caller owns the
    /// backoff schedule.
    pub async fn poll(
        &self,
        folder: &str,
        parse_queue: &mpsc::Sender<Uuid>,
    ) -> Result<PollStats, IngestError> {
        let cursor = self.cursors.load(folder).await?;

        let messages = match self
            .provider
            .list(folder, cursor.last_uid, self.batch_size)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                let streak = self.cursors.record_error(folder, &e.to_string()).await?;
                log::warn!("poll {} failed (streak {}): {}", folder, streak, e);
                return Err(e.into());
            }
        };

        let mut stats = PollStats {
            fetched: messages.len(),
            ..PollStats::default()
        };
        let mut highest_uid = cursor.last_uid;

        // Strict UID order; a failure mid-batch leaves the cursor at
        // the last fully committed message.
        for message in messages {
            let key = idempotency_key(folder, message.uid, &message.message_id);

            match self.idempotency.begin(&key).await? {
                Begin::Completed(_) => {
                    stats.skipped += 1;
                    highest_uid = highest_uid.max(message.uid);
                    continue;
                }
                Begin::InProgress => {
                    // Another worker owns this message right now; stop
                    // here so the cursor cannot jump past it.
                    log::debug!("{}: uid {} in flight elsewhere, stopping batch", folder, message.uid);
                    break;
                }
                Begin::Fresh => {}
            }

            let raw_email_id = self.store_message(folder, &message).await?;

            // Raw mail is committed before the message is acknowledged;
            // a crash here is recovered by the reprocess sweeper.
            if parse_queue.send(raw_email_id).await.is_err() {
                return Err(IngestError::QueueClosed);
            }

            self.idempotency
                .complete(&key, Some(serde_json::json!({ "raw_email_id": raw_email_id })))
                .await?;

            stats.stored += 1;
            highest_uid = highest_uid.max(message.uid);
        }

        if highest_uid > cursor.last_uid || stats.fetched > 0 {
            self.cursors
                .advance(folder, highest_uid, stats.stored as i64)
                .await?;
        }

        if stats.stored > 0 {
            log::info!(
                "poll {}: {} fetched, {} stored, {} duplicates",
                folder,
                stats.fetched,
                stats.stored,
                stats.skipped
            );
        }

        Ok(stats)
    }

    async fn store_message(
        &self,
        folder: &str,
        message: &FetchedMessage,
    ) -> Result<Uuid, sqlx::Error> {
        let new_email = NewRawEmail {
            folder: folder.to_string(),
            uid: message.uid,
            message_id: message.message_id.clone(),
            subject: message.subject.clone(),
            from_addr: message.from_addr.clone(),
            to_addrs: message.to_addrs.clone(),
            date_header: message.date,
            headers: message.headers.clone(),
            body_text: message.body_text.clone(),
            body_html: message.body_html.clone(),
            ics_payload: message.ics.clone(),
            attachments: message.attachments.clone(),
        };

        self.raw_emails.upsert(&new_email).await
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        self.provider.poll_interval()
    }
}

/// `sha256(folder + ":" + uid + ":" + message_id)`, hex.
pub fn idempotency_key(folder: &str, uid: i64, message_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(folder.as_bytes());
    hasher.update(b":");
    hasher.update(uid.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(message_id.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_stable_and_bounded() {
        let a = idempotency_key("INBOX", 7, "alert-1@monitor");
        let b = idempotency_key("INBOX", 7, "alert-1@monitor");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        assert_ne!(a, idempotency_key("INBOX", 8, "alert-1@monitor"));
        assert_ne!(a, idempotency_key("Archive", 7, "alert-1@monitor"));
    }
}
