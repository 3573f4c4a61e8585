//! Incident read queries for the API surface and the maintenance tick.
//! State transitions happen in the correlator, which is the only writer
//! of the correlated fields.

use crate::models::{AlertEvent, Incident, IncidentStatus};
use rocket_db_pools::sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

#[derive(Clone)]
pub struct IncidentStore {
    pool: PgPool,
}

impl IncidentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Incident>, sqlx::Error> {
        sqlx::query_as::<_, Incident>("SELECT * FROM incidents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list(
        &self,
        statuses: &[IncidentStatus],
        page: i64,
        size: i64,
    ) -> Result<(Vec<Incident>, i64), sqlx::Error> {
        let page = page.max(1);
        let size = size.clamp(1, 100);
        let offset = (page - 1) * size;

        let mut count_builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM incidents");
        push_status_filter(&mut count_builder, statuses);
        let total = count_builder
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;

        let mut data_builder = QueryBuilder::<Postgres>::new("SELECT * FROM incidents");
        push_status_filter(&mut data_builder, statuses);
        data_builder.push(" ORDER BY last_seen_at DESC, id DESC");
        data_builder.push(" LIMIT ");
        data_builder.push_bind(size);
        data_builder.push(" OFFSET ");
        data_builder.push_bind(offset);

        let incidents = data_builder
            .build_query_as::<Incident>()
            .fetch_all(&self.pool)
            .await?;

        Ok((incidents, total))
    }

    /// The alert events linked to an incident, oldest first.
    pub async fn linked_events(&self, incident_id: Uuid) -> Result<Vec<AlertEvent>, sqlx::Error> {
        sqlx::query_as::<_, AlertEvent>(
            r#"
            SELECT e.* FROM alert_events e
            JOIN incident_events ie ON ie.alert_event_id = e.id
            WHERE ie.incident_id = $1
            ORDER BY e.occurred_at
            "#,
        )
        .bind(incident_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Incidents currently flagged as in maintenance; the tick
    /// re-evaluates these against the active window set.
    pub async fn in_maintenance(&self) -> Result<Vec<Incident>, sqlx::Error> {
        sqlx::query_as::<_, Incident>(
            "SELECT * FROM incidents WHERE is_in_maintenance ORDER BY last_seen_at DESC",
        )
        .fetch_all(&self.pool)
        .await
    }

    /// Clear the maintenance flag once no active window covers the
    /// incident any more.
    pub async fn clear_maintenance(&self, incident_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE incidents
            SET is_in_maintenance = FALSE, maintenance_window_id = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(incident_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn push_status_filter(builder: &mut QueryBuilder<'_, Postgres>, statuses: &[IncidentStatus]) {
    if statuses.is_empty() {
        return;
    }
    builder.push(" WHERE status IN (");
    {
        let mut separated = builder.separated(", ");
        for status in statuses {
            separated.push_bind(*status);
        }
    }
    builder.push(")");
}
