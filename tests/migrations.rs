use ngs_server::test_support::{TestDatabase, TestDatabaseError};
use sqlx::migrate::Migrator;

static TEST_MIGRATOR: Migrator = sqlx::migrate!("./migrations");

async fn table_count(pool: &sqlx::PgPool, table: &str) -> i64 {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = 'public' AND table_name = $1",
    )
    .bind(table)
    .fetch_one(pool)
    .await
    .expect("lookup succeeded")
}

#[tokio::test]
async fn migrations_apply_and_revert_cleanly() {
    let test_db = match TestDatabase::new_from_env().await {
        Ok(db) => db,
        Err(TestDatabaseError::Container(err)) => {
            eprintln!("skipping migration test: no container runtime ({err})");
            return;
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    };

    let pool = test_db.pool_clone();

    TEST_MIGRATOR.run(&pool).await.expect("migrations run");
    assert_eq!(table_count(&pool, "incidents").await, 1);

    TEST_MIGRATOR
        .undo(&pool, 0)
        .await
        .expect("migrations revert");
    assert_eq!(
        table_count(&pool, "incidents").await,
        0,
        "incidents should be dropped after revert"
    );

    TEST_MIGRATOR.run(&pool).await.expect("migrations rerun");
    assert_eq!(table_count(&pool, "raw_emails").await, 1);

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn live_incident_index_rejects_second_open_row() {
    let test_db = match TestDatabase::new_from_env().await {
        Ok(db) => db,
        Err(TestDatabaseError::Container(err)) => {
            eprintln!("skipping index test: no container runtime ({err})");
            return;
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    };

    let pool = test_db.pool_clone();

    let insert = r#"
        INSERT INTO incidents
            (id, fingerprint, title, source_tool, host, status, severity_current,
             severity_max, last_state, first_seen_at, last_seen_at)
        VALUES
            (gen_random_uuid(), $1, 'http down', 'nagios', 'web-01', $2::incident_status,
             'critical', 'critical', 'firing', NOW(), NOW())
    "#;

    sqlx::query(insert)
        .bind("a".repeat(32))
        .bind("open")
        .execute(&pool)
        .await
        .expect("first live incident inserts");

    // A second live row for the same fingerprint must hit the partial
    // unique index.
    let err = sqlx::query(insert)
        .bind("a".repeat(32))
        .bind("acknowledged")
        .execute(&pool)
        .await
        .expect_err("second live incident must be rejected");
    assert!(err.to_string().contains("incidents_live_fingerprint_idx"));

    // A resolved row for the same fingerprint is fine.
    sqlx::query(
        r#"
        INSERT INTO incidents
            (id, fingerprint, title, source_tool, host, status, severity_current,
             severity_max, last_state, first_seen_at, last_seen_at, resolved_at)
        VALUES
            (gen_random_uuid(), $1, 'http down', 'nagios', 'web-01', 'resolved',
             'critical', 'critical', 'resolved', NOW(), NOW(), NOW())
        "#,
    )
    .bind("a".repeat(32))
    .execute(&pool)
    .await
    .expect("resolved duplicate fingerprint is allowed");

    test_db.close().await.expect("failed to drop test database");
}
