//! Maintenance engine: window storage, scope matching, suppression
//! decisions, and the periodic evaluation tick.
//!
//! Each worker keeps a TTL-bounded snapshot of the active window set so
//! the hot path does not hit the database per event; any window write
//! invalidates the snapshot.

pub mod detect;
pub mod ics;
pub mod scope;

use crate::config::MaintenanceConfig;
use crate::models::{MaintenanceWindow, SuppressMode, WindowSource};
use crate::store::IncidentStore;
use chrono::{DateTime, Utc};
use detect::WindowCandidate;
use parking_lot::RwLock;
use rocket_db_pools::sqlx::PgPool;
use scope::{ScopeTarget, SelectorHit};
use serde_json::Value;
use std::time::Instant;
use uuid::Uuid;

struct CachedWindows {
    windows: Vec<MaintenanceWindow>,
    fetched_at: Instant,
}

/// One matching window with the selectors that matched.
#[derive(Debug, Clone)]
pub struct WindowMatch {
    pub window: MaintenanceWindow,
    pub hits: Vec<SelectorHit>,
}

/// The suppression decision for one event.
#[derive(Debug, Clone)]
pub struct SuppressionDecision {
    /// All matching windows, for match records.
    pub matches: Vec<WindowMatch>,
    /// The strongest mode across matches (mute > digest > downgrade).
    pub mode: SuppressMode,
    /// The window recorded on the incident.
    pub window_id: Uuid,
}

pub struct MaintenanceEngine {
    pool: PgPool,
    config: MaintenanceConfig,
    cache: RwLock<Option<CachedWindows>>,
}

impl MaintenanceEngine {
    pub fn new(pool: PgPool, config: MaintenanceConfig) -> Self {
        Self {
            pool,
            config,
            cache: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &MaintenanceConfig {
        &self.config
    }

    /// Drop the cached window set. Called after any window write.
    pub fn invalidate_cache(&self) {
        *self.cache.write() = None;
    }

    /// The windows active right now, from the snapshot when fresh.
    pub async fn active_windows(&self) -> Result<Vec<MaintenanceWindow>, sqlx::Error> {
        {
            let guard = self.cache.read();
            if let Some(cached) = guard.as_ref() {
                if cached.fetched_at.elapsed() < self.config.window_cache_ttl {
                    return Ok(cached.windows.clone());
                }
            }
        }

        let now = Utc::now();
        let windows = sqlx::query_as::<_, MaintenanceWindow>(
            r#"
            SELECT * FROM maintenance_windows
            WHERE is_active AND starts_at <= $1 AND ends_at > $1
            ORDER BY starts_at
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        *self.cache.write() = Some(CachedWindows {
            windows: windows.clone(),
            fetched_at: Instant::now(),
        });

        Ok(windows)
    }

    /// Evaluate an event-shaped target against the active window set.
    /// `None` means no window applies and the event proceeds untouched.
    pub async fn evaluate(
        &self,
        target: &ScopeTarget<'_>,
    ) -> Result<Option<SuppressionDecision>, sqlx::Error> {
        let windows = self.active_windows().await?;

        let matches: Vec<WindowMatch> = windows
            .into_iter()
            .filter_map(|window| {
                scope::matches(&window.scope, target).map(|hits| WindowMatch { window, hits })
            })
            .collect();

        if matches.is_empty() {
            return Ok(None);
        }

        let mode = matches
            .iter()
            .map(|m| m.window.suppress_mode)
            .max_by_key(|mode| match mode {
                SuppressMode::Mute => 2,
                SuppressMode::Digest => 1,
                SuppressMode::Downgrade => 0,
            })
            .unwrap_or(SuppressMode::Mute);

        let window_id = matches[0].window.id;

        Ok(Some(SuppressionDecision {
            matches,
            mode,
            window_id,
        }))
    }

    /// Persist one match record per matching window, naming the
    /// selectors that matched.
    pub async fn record_matches(
        &self,
        decision: &SuppressionDecision,
        incident_id: Option<Uuid>,
        alert_event_id: Option<Uuid>,
    ) -> Result<(), sqlx::Error> {
        for window_match in &decision.matches {
            let reason = serde_json::json!({
                "mode": window_match.window.suppress_mode,
                "selectors": window_match
                    .hits
                    .iter()
                    .map(|hit| {
                        serde_json::json!({
                            "key": hit.key,
                            "pattern": hit.pattern,
                            "matched_value": hit.value,
                        })
                    })
                    .collect::<Vec<_>>(),
            });

            sqlx::query(
                r#"
                INSERT INTO maintenance_matches
                    (id, window_id, incident_id, alert_event_id, match_reason)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(window_match.window.id)
            .bind(incident_id)
            .bind(alert_event_id)
            .bind(reason)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    /// Insert a detected window, upserting on `(source,
    /// external_event_id)` so a re-delivered invite updates in place.
    pub async fn upsert_candidate(
        &self,
        candidate: &WindowCandidate,
    ) -> Result<MaintenanceWindow, sqlx::Error> {
        let window = if candidate.external_event_id.is_some() {
            sqlx::query_as::<_, MaintenanceWindow>(
                r#"
                INSERT INTO maintenance_windows
                    (id, source, external_event_id, title, organizer, starts_at, ends_at,
                     timezone, scope, suppress_mode, is_recurring, recurrence_rule)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (source, external_event_id) WHERE external_event_id IS NOT NULL
                DO UPDATE SET
                    title = EXCLUDED.title,
                    organizer = EXCLUDED.organizer,
                    starts_at = EXCLUDED.starts_at,
                    ends_at = EXCLUDED.ends_at,
                    timezone = EXCLUDED.timezone,
                    scope = EXCLUDED.scope,
                    suppress_mode = EXCLUDED.suppress_mode,
                    is_recurring = EXCLUDED.is_recurring,
                    recurrence_rule = EXCLUDED.recurrence_rule,
                    updated_at = NOW()
                RETURNING *
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(candidate.source)
            .bind(&candidate.external_event_id)
            .bind(&candidate.title)
            .bind(&candidate.organizer)
            .bind(candidate.starts_at)
            .bind(candidate.ends_at)
            .bind(&candidate.timezone)
            .bind(&candidate.scope)
            .bind(candidate.suppress_mode)
            .bind(candidate.is_recurring)
            .bind(&candidate.recurrence_rule)
            .fetch_one(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, MaintenanceWindow>(
                r#"
                INSERT INTO maintenance_windows
                    (id, source, title, organizer, starts_at, ends_at, timezone,
                     scope, suppress_mode, is_recurring, recurrence_rule)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                RETURNING *
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(candidate.source)
            .bind(&candidate.title)
            .bind(&candidate.organizer)
            .bind(candidate.starts_at)
            .bind(candidate.ends_at)
            .bind(&candidate.timezone)
            .bind(&candidate.scope)
            .bind(candidate.suppress_mode)
            .bind(candidate.is_recurring)
            .bind(&candidate.recurrence_rule)
            .fetch_one(&self.pool)
            .await?
        };

        self.invalidate_cache();
        log::info!(
            "maintenance window {} `{}` [{} .. {}]",
            window.id,
            window.title,
            window.starts_at,
            window.ends_at
        );
        Ok(window)
    }

    /// Create a manually declared window.
    pub async fn create_manual(
        &self,
        title: &str,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        timezone: &str,
        scope: Value,
        suppress_mode: SuppressMode,
    ) -> Result<MaintenanceWindow, sqlx::Error> {
        let candidate = WindowCandidate {
            source: WindowSource::Manual,
            external_event_id: None,
            title: title.to_string(),
            organizer: None,
            starts_at,
            ends_at,
            timezone: timezone.to_string(),
            scope,
            suppress_mode,
            is_recurring: false,
            recurrence_rule: None,
        };
        self.upsert_candidate(&candidate).await
    }

    pub async fn deactivate(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE maintenance_windows SET is_active = FALSE, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.invalidate_cache();
        Ok(result.rows_affected() > 0)
    }

    pub async fn list(&self, active_only: bool) -> Result<Vec<MaintenanceWindow>, sqlx::Error> {
        let query = if active_only {
            "SELECT * FROM maintenance_windows WHERE is_active ORDER BY starts_at DESC"
        } else {
            "SELECT * FROM maintenance_windows ORDER BY starts_at DESC"
        };
        sqlx::query_as::<_, MaintenanceWindow>(query)
            .fetch_all(&self.pool)
            .await
    }

    /// Evaluation tick: incidents flagged as in maintenance whose
    /// covering windows have all ended flip back to normal routing.
    pub async fn tick(&self, incidents: &IncidentStore) -> Result<u64, sqlx::Error> {
        let flagged = incidents.in_maintenance().await?;
        if flagged.is_empty() {
            return Ok(0);
        }

        let mut cleared = 0;
        for incident in flagged {
            let target = ScopeTarget {
                host: &incident.host,
                service: &incident.service,
                env: &incident.environment,
                region: &incident.region,
                tags: &[],
            };
            if self.evaluate(&target).await?.is_none() {
                incidents.clear_maintenance(incident.id).await?;
                cleared += 1;
                log::info!("incident {} left maintenance", incident.id);
            }
        }

        Ok(cleared)
    }
}
