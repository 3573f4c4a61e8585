//! Exactly-once machinery: idempotency reservations and the
//! dead-letter retry queue.


use ngs_server::config::{DlqConfig, IdempotencyConfig};
use ngs_server::models::DeadLetterStatus;
use ngs_server::store::{Begin, DeadLetterStore, IdempotencyStore};
use ngs_server::test_support::{TestDatabase, TestDatabaseError};
use std::time::Duration;

async fn provision() -> Option<TestDatabase> {
    match TestDatabase::new_from_env().await {
        Ok(db) => Some(db),
        Err(TestDatabaseError::Container(err)) => {
            eprintln!("skipping test: no container runtime ({err})");
            None
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    }
}

#[tokio::test]
async fn idempotency_begin_complete_round_trip() {
    let Some(db) = provision().await else {
        return;
    };
    let store = IdempotencyStore::new(
        db.pool_clone(),
        IdempotencyConfig {
            ttl: Duration::from_secs(3600),
            stale_after: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(3600),
        },
    );

    assert_eq!(store.begin("step-1").await.unwrap(), Begin::Fresh);
    // A concurrent worker sees the fresh reservation as in progress.
    assert_eq!(store.begin("step-1").await.unwrap(), Begin::InProgress);

    store
        .complete("step-1", Some(serde_json::json!({"raw_email_id": "x"})))
        .await
        .unwrap();

    match store.begin("step-1").await.unwrap() {
        Begin::Completed(Some(result)) => {
            assert_eq!(result["raw_email_id"], "x");
        }
        other => panic!("expected completed reservation, got {other:?}"),
    }
}

#[tokio::test]
async fn stale_processing_reservation_is_reclaimed() {
    let Some(db) = provision().await else {
        return;
    };
    let store = IdempotencyStore::new(
        db.pool_clone(),
        IdempotencyConfig {
            ttl: Duration::from_secs(3600),
            // Everything is immediately stale.
            stale_after: Duration::from_secs(0),
            cleanup_interval: Duration::from_secs(3600),
        },
    );

    assert_eq!(store.begin("crashed-step").await.unwrap(), Begin::Fresh);
    // The original worker died; the reservation is older than the
    // stale threshold, so the next consumer takes it over.
    assert_eq!(store.begin("crashed-step").await.unwrap(), Begin::Fresh);
}

#[tokio::test]
async fn expired_keys_are_purged() {
    let Some(db) = provision().await else {
        return;
    };
    let store = IdempotencyStore::new(
        db.pool_clone(),
        IdempotencyConfig {
            ttl: Duration::from_secs(0),
            stale_after: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(3600),
        },
    );

    store.begin("short-lived").await.unwrap();
    let purged = store.purge_expired().await.unwrap();
    assert_eq!(purged, 1);
    assert_eq!(store.begin("short-lived").await.unwrap(), Begin::Fresh);
}

#[tokio::test]
async fn dead_letter_retries_back_off_and_exhaust() {
    let Some(db) = provision().await else {
        return;
    };
    let store = DeadLetterStore::new(
        db.pool_clone(),
        DlqConfig {
            base_backoff: Duration::from_secs(30),
            cap_backoff: Duration::from_secs(3600),
            max_retries: 2,
            sweep_interval: Duration::from_secs(60),
        },
    );

    store
        .push(
            "parse_email",
            serde_json::json!({"raw_email_id": "00000000-0000-0000-0000-000000000000"}),
            "llm timed out",
        )
        .await
        .unwrap();

    // Due immediately on the first claim.
    let claimed = store.claim_due(10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    let entry = &claimed[0];
    assert_eq!(entry.retry_count, 0);

    // First failed retry reschedules into the future.
    store.mark_retry_failed(entry, "still down").await.unwrap();
    assert!(store.claim_due(10).await.unwrap().is_empty(), "not due yet");

    let (status, retry_count): (DeadLetterStatus, i32) =
        sqlx::query_as("SELECT status, retry_count FROM dead_letters")
            .fetch_one(&db.pool_clone())
            .await
            .unwrap();
    assert_eq!(status, DeadLetterStatus::Pending);
    assert_eq!(retry_count, 1);

    // Force it due again, then exhaust the retry budget.
    sqlx::query("UPDATE dead_letters SET next_retry_at = NOW()")
        .execute(&db.pool_clone())
        .await
        .unwrap();
    let claimed = store.claim_due(10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    store
        .mark_retry_failed(&claimed[0], "still down")
        .await
        .unwrap();

    let status: DeadLetterStatus = sqlx::query_scalar("SELECT status FROM dead_letters")
        .fetch_one(&db.pool_clone())
        .await
        .unwrap();
    assert_eq!(status, DeadLetterStatus::Failed);

    // Explicit re-dispatch puts a failed entry back in play.
    let entry_id = claimed[0].id;
    assert!(store.redispatch(entry_id).await.unwrap());
    let claimed = store.claim_due(10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    store.mark_resolved(entry_id).await.unwrap();

    let status: DeadLetterStatus = sqlx::query_scalar("SELECT status FROM dead_letters")
        .fetch_one(&db.pool_clone())
        .await
        .unwrap();
    assert_eq!(status, DeadLetterStatus::Resolved);
}
