//! End-to-end pipeline scenarios: mail in the drop folder all the way
//! to incident state.

mod common;

use common::{Harness, nagios_mail};
use ngs_server::models::{AlertState, IncidentStatus, ParseStatus, Severity, SuppressMode};
use ngs_server::parse::llm::{LlmExtraction, LlmFields};
use sqlx::Row;

async fn single_incident(pool: &sqlx::PgPool) -> ngs_server::models::Incident {
    let incidents = sqlx::query_as::<_, ngs_server::models::Incident>("SELECT * FROM incidents")
        .fetch_all(pool)
        .await
        .expect("query incidents");
    assert_eq!(incidents.len(), 1, "expected exactly one incident");
    incidents.into_iter().next().unwrap()
}

#[tokio::test]
async fn new_alert_creates_open_incident() {
    let Some(mut harness) = Harness::new(Vec::new()).await else {
        return;
    };

    harness.deliver(&nagios_mail("a1@monitor", "web-01", "http", "PROBLEM", "CRITICAL"));
    harness.run_pipeline().await;

    let pool = harness.pool();
    let incident = single_incident(&pool).await;
    assert_eq!(incident.status, IncidentStatus::Open);
    assert_eq!(incident.host, "web-01");
    assert_eq!(incident.service, "http");
    assert_eq!(incident.severity_current, Severity::Critical);
    assert_eq!(incident.severity_max, Severity::Critical);
    assert_eq!(incident.last_state, AlertState::Firing);
    assert_eq!(incident.event_count, 1);
    assert_eq!(incident.fingerprint.len(), 32);

    let event = sqlx::query_as::<_, ngs_server::models::AlertEvent>("SELECT * FROM alert_events")
        .fetch_one(&pool)
        .await
        .expect("one event");
    assert_eq!(event.host, "web-01");
    assert_eq!(event.state, AlertState::Firing);
    assert!(!event.is_suppressed);

    let status: ParseStatus =
        sqlx::query_scalar("SELECT parse_status FROM raw_emails LIMIT 1")
            .fetch_one(&pool)
            .await
            .expect("raw email status");
    assert_eq!(status, ParseStatus::Parsed);
}

#[tokio::test]
async fn duplicate_alert_links_as_deduplicated() {
    let Some(mut harness) = Harness::new(Vec::new()).await else {
        return;
    };

    harness.deliver(&nagios_mail("d1@monitor", "web-01", "http", "PROBLEM", "CRITICAL"));
    harness.run_pipeline().await;
    harness.deliver(&nagios_mail("d2@monitor", "web-01", "http", "PROBLEM", "CRITICAL"));
    harness.run_pipeline().await;

    let pool = harness.pool();
    let incident = single_incident(&pool).await;
    assert_eq!(incident.event_count, 2);

    let dedup_flags: Vec<bool> = sqlx::query(
        "SELECT is_deduplicated FROM incident_events ORDER BY created_at",
    )
    .fetch_all(&pool)
    .await
    .expect("links")
    .into_iter()
    .map(|row| row.get::<bool, _>(0))
    .collect();
    assert_eq!(dedup_flags, vec![false, true]);
}

#[tokio::test]
async fn severity_escalation_tracks_current_and_max() {
    let Some(mut harness) = Harness::new(Vec::new()).await else {
        return;
    };

    harness.deliver(&nagios_mail("e1@monitor", "web-01", "http", "PROBLEM", "WARNING"));
    harness.run_pipeline().await;
    harness.deliver(&nagios_mail("e2@monitor", "web-01", "http", "PROBLEM", "CRITICAL"));
    harness.run_pipeline().await;

    let pool = harness.pool();
    let incident = single_incident(&pool).await;
    assert_eq!(incident.event_count, 2, "escalation must not fork the incident");
    assert_eq!(incident.severity_current, Severity::Critical);
    assert_eq!(incident.severity_max, Severity::Critical);
}

#[tokio::test]
async fn recovery_resolves_after_quiet_period() {
    let Some(mut harness) = Harness::new(Vec::new()).await else {
        return;
    };

    harness.deliver(&nagios_mail("r1@monitor", "web-01", "http", "PROBLEM", "CRITICAL"));
    harness.run_pipeline().await;
    harness.deliver(&nagios_mail("r2@monitor", "web-01", "http", "RECOVERY", "OK"));
    harness.run_pipeline().await;

    let pool = harness.pool();
    let incident = single_incident(&pool).await;
    // The intermediate state is unconditional on a resolve event.
    assert_eq!(incident.status, IncidentStatus::Resolving);
    assert_eq!(incident.last_state, AlertState::Resolved);
    assert!(incident.resolved_at.is_none());

    // With the quiet period elapsed (zero in tests), the sweeper
    // finalizes the resolution.
    let sweeper = ngs_server::correlate::sweeper::ResolveSweeper::new(
        pool.clone(),
        common::test_config(harness.mail_root.path()).correlation,
        std::sync::Arc::new(ngs_server::correlate::LogNotificationSink),
    );
    sweeper.sweep().await.expect("sweep");

    let incident = single_incident(&pool).await;
    assert_eq!(incident.status, IncidentStatus::Resolved);
    assert!(incident.resolved_at.is_some());
    assert_eq!(incident.resolution_reason.as_deref(), Some("recovery"));
}

#[tokio::test]
async fn maintenance_window_mutes_matching_alert() {
    let Some(mut harness) = Harness::new(Vec::new()).await else {
        return;
    };
    let pool = harness.pool();

    let now = chrono::Utc::now();
    harness
        .pipeline
        .maintenance
        .create_manual(
            "switch upgrade",
            now - chrono::Duration::hours(1),
            now + chrono::Duration::hours(1),
            "UTC",
            serde_json::json!({"host": ["web-*"]}),
            SuppressMode::Mute,
        )
        .await
        .expect("window created");

    harness.deliver(&nagios_mail("m1@monitor", "web-01", "http", "PROBLEM", "CRITICAL"));
    harness.run_pipeline().await;

    let event = sqlx::query_as::<_, ngs_server::models::AlertEvent>("SELECT * FROM alert_events")
        .fetch_one(&pool)
        .await
        .expect("one event");
    assert!(event.is_suppressed);
    assert_eq!(event.suppression_reason.as_deref(), Some("maintenance_mute"));

    let incident = single_incident(&pool).await;
    assert!(incident.is_in_maintenance);
    assert!(incident.maintenance_window_id.is_some());

    let reason: serde_json::Value =
        sqlx::query_scalar("SELECT match_reason FROM maintenance_matches")
            .fetch_one(&pool)
            .await
            .expect("match recorded");
    let selectors = reason["selectors"].as_array().expect("selectors array");
    assert_eq!(selectors[0]["key"], "host");
    assert_eq!(selectors[0]["pattern"], "web-*");
    assert_eq!(selectors[0]["matched_value"], "web-01");
}

#[tokio::test]
async fn downgrade_window_reduces_severity_one_step() {
    let Some(mut harness) = Harness::new(Vec::new()).await else {
        return;
    };
    let pool = harness.pool();

    let now = chrono::Utc::now();
    harness
        .pipeline
        .maintenance
        .create_manual(
            "rolling restart",
            now - chrono::Duration::hours(1),
            now + chrono::Duration::hours(1),
            "UTC",
            serde_json::json!({"host": ["web-*"]}),
            SuppressMode::Downgrade,
        )
        .await
        .expect("window created");

    harness.deliver(&nagios_mail("g1@monitor", "web-01", "http", "PROBLEM", "CRITICAL"));
    harness.run_pipeline().await;

    let event = sqlx::query_as::<_, ngs_server::models::AlertEvent>("SELECT * FROM alert_events")
        .fetch_one(&pool)
        .await
        .expect("one event");
    assert!(!event.is_suppressed, "downgrade does not mute");
    assert_eq!(event.severity, Severity::High);
    assert_eq!(event.payload["original_severity"], "critical");
}

#[tokio::test]
async fn llm_learns_pattern_and_cache_handles_next_email() {
    let response = LlmExtraction {
        fields: LlmFields {
            host: "db-77".to_string(),
            service: String::new(),
            severity: "high".to_string(),
            state: "firing".to_string(),
        },
        confidence: 0.92,
        rules: serde_json::json!({
            "host": {"source": "body", "regex": r"node (\S+) is"},
            "severity": {"source": "body", "regex": r"severity=(\w+)"},
            "state": {
                "source": "body",
                "regex": r"is (down|up)",
                "map": {"down": "firing", "up": "resolved"}
            }
        }),
    };
    let Some(mut harness) = Harness::new(vec![response]).await else {
        return;
    };
    let pool = harness.pool();

    let novel_mail = |id: &str, host: &str| {
        format!(
            "Message-ID: <{id}>\r\n\
             Subject: DISK ALERT on {host}\r\n\
             From: Watcher <alerts@novel-tool.example.net>\r\n\
             Date: Mon, 20 Jul 2026 10:00:00 +0000\r\n\
             \r\n\
             node {host} is down severity=high\r\n"
        )
    };

    harness.deliver(&novel_mail("n1@novel", "db-77"));
    harness.run_pipeline().await;

    assert_eq!(harness.extractor.call_count(), 1);

    let (match_count, success_rate, approved): (i64, f64, bool) = sqlx::query_as(
        "SELECT match_count, success_rate, is_approved FROM pattern_cache",
    )
    .fetch_one(&pool)
    .await
    .expect("pattern learned");
    assert_eq!(match_count, 1);
    assert!(success_rate >= 99.9);
    assert!(!approved, "learned patterns start unapproved");

    // A second email of the same shape must hit the cache, not the LLM.
    harness.deliver(&novel_mail("n2@novel", "db-78"));
    harness.run_pipeline().await;

    assert_eq!(harness.extractor.call_count(), 1, "LLM consulted once per format");

    let (match_count,): (i64,) = sqlx::query_as("SELECT match_count FROM pattern_cache")
        .fetch_one(&pool)
        .await
        .expect("pattern row");
    assert_eq!(match_count, 2);

    let hosts: Vec<String> =
        sqlx::query_scalar("SELECT host FROM alert_events ORDER BY created_at")
            .fetch_all(&pool)
            .await
            .expect("events");
    assert_eq!(hosts, vec!["db-77", "db-78"]);

    let kinds: Vec<String> = sqlx::query_scalar(
        "SELECT extraction_type::text FROM pattern_extraction_log ORDER BY created_at",
    )
    .fetch_all(&pool)
    .await
    .expect("log");
    assert_eq!(kinds, vec!["learned_new", "cached"]);
}

#[tokio::test]
async fn low_confidence_extraction_is_quarantined() {
    let response = LlmExtraction {
        fields: LlmFields {
            host: "db-77".to_string(),
            service: String::new(),
            severity: "high".to_string(),
            state: "firing".to_string(),
        },
        confidence: 0.30,
        rules: serde_json::Value::Null,
    };
    let Some(mut harness) = Harness::new(vec![response]).await else {
        return;
    };
    let pool = harness.pool();

    harness.deliver(
        "Message-ID: <q1@novel>\r\nSubject: something odd\r\nFrom: alerts@odd.example\r\nDate: Mon, 20 Jul 2026 10:00:00 +0000\r\n\r\nunparseable noise\r\n",
    );
    harness.run_pipeline().await;

    let quarantined: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM quarantine_events")
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(quarantined, 1);

    let status: ParseStatus = sqlx::query_scalar("SELECT parse_status FROM raw_emails")
        .fetch_one(&pool)
        .await
        .expect("status");
    assert_eq!(status, ParseStatus::Quarantined);

    let events: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM alert_events")
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(events, 0, "no alert event from a quarantined extraction");
}

#[tokio::test]
async fn maintenance_announcement_creates_window_not_alert() {
    let Some(mut harness) = Harness::new(Vec::new()).await else {
        return;
    };
    let pool = harness.pool();

    harness.deliver(
        "Message-ID: <mw1@noc>\r\n\
         Subject: [MW] core switch upgrade\r\n\
         From: noc@example.com\r\n\
         Date: Mon, 20 Jul 2026 10:00:00 +0000\r\n\
         \r\n\
         Title: Core switch upgrade\r\n\
         Scope: host=web-*; env=prod\r\n\
         Mode: mute\r\n\
         Start: 2026-07-20 22:00\r\n\
         End: 2026-07-21 02:00\r\n\
         Timezone: UTC\r\n",
    );
    harness.run_pipeline().await;

    let windows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM maintenance_windows")
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(windows, 1);

    let events: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM alert_events")
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(events, 0, "announcements are not alerts");

    let (mode, tz): (SuppressMode, String) =
        sqlx::query_as("SELECT suppress_mode, timezone FROM maintenance_windows")
            .fetch_one(&pool)
            .await
            .expect("window");
    assert_eq!(mode, SuppressMode::Mute);
    assert_eq!(tz, "UTC");
}

#[tokio::test]
async fn repolling_does_not_duplicate_raw_emails() {
    let Some(mut harness) = Harness::new(Vec::new()).await else {
        return;
    };
    let pool = harness.pool();

    harness.deliver(&nagios_mail("i1@monitor", "web-01", "http", "PROBLEM", "CRITICAL"));
    harness.run_pipeline().await;
    // Second poll sees the same file; the cursor and idempotency key
    // make it a no-op.
    harness.run_pipeline().await;

    let raw_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_emails")
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(raw_count, 1);

    let (last_uid, processed): (i64, i64) = sqlx::query_as(
        "SELECT last_uid, emails_processed FROM folder_cursors WHERE folder = 'INBOX'",
    )
    .fetch_one(&pool)
    .await
    .expect("cursor");
    assert_eq!(last_uid, 1);
    assert_eq!(processed, 1);
}
