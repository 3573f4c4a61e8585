//! Periodic correlation sweeps: silence-timeout auto-resolution and
//! quiet-period finalization of resolving incidents.

use crate::config::CorrelationConfig;
use crate::correlate::{Notification, NotificationSink};
use chrono::{Duration as ChronoDuration, Utc};
use rocket_db_pools::sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

pub struct ResolveSweeper {
    pool: PgPool,
    config: CorrelationConfig,
    sink: Arc<dyn NotificationSink>,
}

impl ResolveSweeper {
    pub fn new(pool: PgPool, config: CorrelationConfig, sink: Arc<dyn NotificationSink>) -> Self {
        Self { pool, config, sink }
    }

    /// One sweep pass. Returns how many incidents were resolved.
    pub async fn sweep(&self) -> Result<u64, sqlx::Error> {
        let silenced = self.auto_resolve_silent().await?;
        let finalized = self.finalize_resolving().await?;
        Ok(silenced + finalized)
    }

    /// Incidents that have gone quiet: still open/acknowledged, nothing
    /// seen for `auto_resolve_after`, and not last observed firing.
    async fn auto_resolve_silent(&self) -> Result<u64, sqlx::Error> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.config.auto_resolve_after)
                .unwrap_or(ChronoDuration::zero());

        let resolved: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE incidents
            SET status = 'resolved', resolved_at = NOW(),
                resolution_reason = 'silence_timeout', updated_at = NOW()
            WHERE status IN ('open', 'acknowledged')
              AND last_seen_at < $1
              AND last_state <> 'firing'
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        for (id,) in &resolved {
            self.sink
                .notify(Notification::IncidentResolved {
                    incident_id: *id,
                    reason: "silence_timeout".to_string(),
                })
                .await;
        }

        Ok(resolved.len() as u64)
    }

    /// Resolving incidents whose quiet period has elapsed with no new
    /// firing event become resolved.
    async fn finalize_resolving(&self) -> Result<u64, sqlx::Error> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.config.resolve_quiet_period)
                .unwrap_or(ChronoDuration::zero());

        let resolved: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE incidents
            SET status = 'resolved', resolved_at = NOW(),
                resolution_reason = 'recovery', updated_at = NOW()
            WHERE status = 'resolving'
              AND (last_firing_at IS NULL OR last_firing_at < $1)
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        for (id,) in &resolved {
            self.sink
                .notify(Notification::IncidentResolved {
                    incident_id: *id,
                    reason: "recovery".to_string(),
                })
                .await;
        }

        Ok(resolved.len() as u64)
    }
}
