//! Correlator: turns the alert-event stream into incident state.
//!
//! All mutations for one event happen inside a single transaction,
//! serialized per fingerprint by a Postgres advisory lock; the partial
//! unique index on live incidents backstops the one-live-incident rule
//! against anything that bypasses the lock. The correlator is the only
//! writer of incident rows.

pub mod sweeper;

use crate::config::CorrelationConfig;
use crate::models::{AlertEvent, AlertState, Incident, IncidentStatus, Severity};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rocket_db_pools::sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use uuid::Uuid;

/// Events the correlator must surface to the outside world. The sink is
/// a narrow seam; routing/paging lives behind it, out of scope here.
#[derive(Debug, Clone)]
pub enum Notification {
    IncidentOpened {
        incident_id: Uuid,
        fingerprint: String,
        severity: Severity,
        title: String,
    },
    SeverityEscalated {
        incident_id: Uuid,
        from: Severity,
        to: Severity,
    },
    IncidentResolved {
        incident_id: Uuid,
        reason: String,
    },
    IncidentReopened {
        incident_id: Uuid,
    },
}

#[rocket::async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Default sink: one log line per notification.
pub struct LogNotificationSink;

#[rocket::async_trait]
impl NotificationSink for LogNotificationSink {
    async fn notify(&self, notification: Notification) {
        match notification {
            Notification::IncidentOpened {
                incident_id,
                fingerprint,
                severity,
                title,
            } => log::info!(
                "incident {} opened [{}] {:?}: {}",
                incident_id,
                fingerprint,
                severity,
                title
            ),
            Notification::SeverityEscalated {
                incident_id,
                from,
                to,
            } => log::warn!("incident {} escalated {:?} -> {:?}", incident_id, from, to),
            Notification::IncidentResolved {
                incident_id,
                reason,
            } => log::info!("incident {} resolved ({})", incident_id, reason),
            Notification::IncidentReopened { incident_id } => {
                log::warn!("incident {} reopened", incident_id)
            }
        }
    }
}

/// What happened to an event.
#[derive(Debug, Clone, PartialEq)]
pub enum CorrelationOutcome {
    Created { incident_id: Uuid },
    Linked { incident_id: Uuid, deduplicated: bool },
    /// A resolve event with no live incident is recorded but creates
    /// nothing.
    Dropped,
}

pub struct Correlator {
    pool: PgPool,
    config: CorrelationConfig,
    sink: Arc<dyn NotificationSink>,
}

impl Correlator {
    pub fn new(pool: PgPool, config: CorrelationConfig, sink: Arc<dyn NotificationSink>) -> Self {
        Self { pool, config, sink }
    }

    /// Apply one event. The event row must already be persisted.
    pub async fn ingest(&self, event: &AlertEvent) -> Result<CorrelationOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // Serialize per fingerprint across all correlator workers.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(&event.fingerprint)
            .execute(&mut *tx)
            .await?;

        let live = sqlx::query_as::<_, Incident>(
            r#"
            SELECT * FROM incidents
            WHERE fingerprint = $1 AND status IN ('open', 'acknowledged', 'resolving')
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(&event.fingerprint)
        .fetch_optional(&mut *tx)
        .await?;

        let (outcome, notifications) = match live {
            None => self.create_incident(&mut tx, event).await?,
            Some(incident) => self.link_event(&mut tx, incident, event).await?,
        };

        tx.commit().await?;

        // Maintenance mute/digest suppresses notifications but never
        // the state changes themselves.
        if !event.is_suppressed {
            for notification in notifications {
                self.sink.notify(notification).await;
            }
        }

        Ok(outcome)
    }

    async fn create_incident(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &AlertEvent,
    ) -> Result<(CorrelationOutcome, Vec<Notification>), sqlx::Error> {
        if event.state == AlertState::Resolved {
            log::debug!(
                "resolve event {} for {} without live incident, dropped",
                event.id,
                event.fingerprint
            );
            return Ok((CorrelationOutcome::Dropped, Vec::new()));
        }

        let incident_id = Uuid::new_v4();
        let last_firing_at = (event.state == AlertState::Firing).then_some(event.occurred_at);

        sqlx::query(
            r#"
            INSERT INTO incidents
                (id, fingerprint, title, source_tool, environment, region, host, check_name,
                 service, status, severity_current, severity_max, last_state, first_seen_at,
                 last_seen_at, last_firing_at, event_count, is_in_maintenance,
                 maintenance_window_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'open', $10, $10, $11, $12, $12, $13,
                    1, $14, $15)
            "#,
        )
        .bind(incident_id)
        .bind(&event.fingerprint)
        .bind(&event.normalized_signature)
        .bind(&event.source_tool)
        .bind(&event.environment)
        .bind(&event.region)
        .bind(&event.host)
        .bind(&event.check_name)
        .bind(&event.service)
        .bind(event.severity)
        .bind(event.state)
        .bind(event.occurred_at)
        .bind(last_firing_at)
        .bind(event.is_suppressed)
        .bind(event.is_suppressed.then_some(maintenance_window_of(event)).flatten())
        .execute(&mut **tx)
        .await?;

        insert_link(tx, incident_id, event.id, false).await?;

        let notifications = vec![Notification::IncidentOpened {
            incident_id,
            fingerprint: event.fingerprint.clone(),
            severity: event.severity,
            title: event.normalized_signature.clone(),
        }];

        Ok((CorrelationOutcome::Created { incident_id }, notifications))
    }

    async fn link_event(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        incident: Incident,
        event: &AlertEvent,
    ) -> Result<(CorrelationOutcome, Vec<Notification>), sqlx::Error> {
        // Repeat occurrence: same content as the last linked event,
        // inside the dedup window.
        let previous: Option<(String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT e.content_hash, e.occurred_at FROM alert_events e
            JOIN incident_events ie ON ie.alert_event_id = e.id
            WHERE ie.incident_id = $1
            ORDER BY ie.created_at DESC
            LIMIT 1
            "#,
        )
        .bind(incident.id)
        .fetch_optional(&mut **tx)
        .await?;

        let dedup_window =
            ChronoDuration::from_std(self.config.dedup_window).unwrap_or(ChronoDuration::zero());
        let deduplicated = previous
            .map(|(hash, occurred_at)| {
                hash == event.content_hash
                    && (event.occurred_at - occurred_at).abs() <= dedup_window
            })
            .unwrap_or(false);

        insert_link(tx, incident.id, event.id, deduplicated).await?;

        // Re-derive the latest-by-occurrence view across all linked
        // events, so out-of-order arrivals converge to the in-order
        // result.
        let (latest_severity, latest_state, latest_occurred): (Severity, AlertState, DateTime<Utc>) =
            sqlx::query_as(
                r#"
                SELECT e.severity, e.state, e.occurred_at FROM alert_events e
                JOIN incident_events ie ON ie.alert_event_id = e.id
                WHERE ie.incident_id = $1
                ORDER BY e.occurred_at DESC, e.created_at DESC
                LIMIT 1
                "#,
            )
            .bind(incident.id)
            .fetch_one(&mut **tx)
            .await?;

        let last_firing_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT MAX(e.occurred_at) FROM alert_events e
            JOIN incident_events ie ON ie.alert_event_id = e.id
            WHERE ie.incident_id = $1 AND e.state = 'firing'
            "#,
        )
        .bind(incident.id)
        .fetch_one(&mut **tx)
        .await?;

        let first_seen_at = incident.first_seen_at.min(event.occurred_at);
        let last_seen_at = incident.last_seen_at.max(event.occurred_at);
        let severity_max = incident.severity_max.max(event.severity).max(latest_severity);

        // Flap accounting: a state change after a gap longer than the
        // flap window restarts the counter.
        let flap_window =
            ChronoDuration::from_std(self.config.flap_window).unwrap_or(ChronoDuration::zero());
        let state_changed = latest_state != incident.last_state;
        let (flap_count, last_state_change_at) = if state_changed {
            let count = match incident.last_state_change_at {
                Some(prev) if latest_occurred - prev <= flap_window => incident.flap_count + 1,
                _ => 1,
            };
            (count, Some(latest_occurred))
        } else {
            (incident.flap_count, incident.last_state_change_at)
        };
        let is_flapping = flap_count >= self.config.flap_threshold;
        if is_flapping && !incident.is_flapping {
            log::warn!(
                "incident {} is flapping ({} state changes)",
                incident.id,
                flap_count
            );
        }

        let mut notifications = Vec::new();

        // Escalations into high/critical are state changes worth
        // surfacing.
        let escalated =
            latest_severity > incident.severity_current && latest_severity >= Severity::High;
        if escalated {
            notifications.push(Notification::SeverityEscalated {
                incident_id: incident.id,
                from: incident.severity_current,
                to: latest_severity,
            });
        }
        let severity_changed_at = escalated.then_some(latest_occurred);

        let quiet = ChronoDuration::from_std(self.config.resolve_quiet_period)
            .unwrap_or(ChronoDuration::zero());
        let mut status = incident.status;
        let mut resolved_at = incident.resolved_at;
        let mut resolution_reason = incident.resolution_reason.clone();

        match latest_state {
            AlertState::Resolved => {
                let quiet_elapsed = last_firing_at
                    .map(|firing| latest_occurred - firing >= quiet)
                    .unwrap_or(true);
                match status {
                    IncidentStatus::Open | IncidentStatus::Acknowledged => {
                        // Unconditional intermediate state on resolve.
                        status = IncidentStatus::Resolving;
                    }
                    IncidentStatus::Resolving if quiet_elapsed => {
                        status = IncidentStatus::Resolved;
                        resolved_at = Some(Utc::now());
                        resolution_reason = Some("recovery".to_string());
                        notifications.push(Notification::IncidentResolved {
                            incident_id: incident.id,
                            reason: "recovery".to_string(),
                        });
                    }
                    _ => {}
                }
            }
            AlertState::Firing => {
                if status == IncidentStatus::Resolving {
                    // A firing event inside the quiet period reverts.
                    status = IncidentStatus::Open;
                    notifications.push(Notification::IncidentReopened {
                        incident_id: incident.id,
                    });
                }
            }
            AlertState::Unknown => {}
        }

        let is_in_maintenance = incident.is_in_maintenance || event.is_suppressed;
        let maintenance_window_id = incident
            .maintenance_window_id
            .or_else(|| maintenance_window_of(event));

        sqlx::query(
            r#"
            UPDATE incidents SET
                status = $2,
                severity_current = $3,
                severity_max = $4,
                last_state = $5,
                first_seen_at = $6,
                last_seen_at = $7,
                last_firing_at = $8,
                resolved_at = $9,
                resolution_reason = $10,
                event_count = event_count + 1,
                flap_count = $11,
                is_flapping = $12,
                last_state_change_at = COALESCE($13, last_state_change_at),
                is_in_maintenance = $14,
                maintenance_window_id = $15,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(incident.id)
        .bind(status)
        .bind(latest_severity)
        .bind(severity_max)
        .bind(latest_state)
        .bind(first_seen_at)
        .bind(last_seen_at)
        .bind(last_firing_at)
        .bind(resolved_at)
        .bind(resolution_reason)
        .bind(flap_count)
        .bind(is_flapping)
        .bind(last_state_change_at.or(severity_changed_at))
        .bind(is_in_maintenance)
        .bind(maintenance_window_id)
        .execute(&mut **tx)
        .await?;

        Ok((
            CorrelationOutcome::Linked {
                incident_id: incident.id,
                deduplicated,
            },
            notifications,
        ))
    }
}

async fn insert_link(
    tx: &mut Transaction<'_, Postgres>,
    incident_id: Uuid,
    alert_event_id: Uuid,
    is_deduplicated: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO incident_events (id, incident_id, alert_event_id, is_deduplicated)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (incident_id, alert_event_id) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(incident_id)
    .bind(alert_event_id)
    .bind(is_deduplicated)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// The maintenance window an event was suppressed by, when recorded in
/// its payload by the maintenance engine.
fn maintenance_window_of(event: &AlertEvent) -> Option<Uuid> {
    event
        .payload
        .get("maintenance_window_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}
