//! Incident read endpoints.

use crate::error::ApiError;
use crate::models::{AlertEvent, ApiResponse, Incident, IncidentStatus, PaginatedResponse};
use crate::pipeline::Pipeline;
use rocket::State;
use rocket::serde::json::Json;
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Incident detail bundled with its linked alert events.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct IncidentDetail {
    pub incident: Incident,
    pub events: Vec<AlertEvent>,
}

fn parse_statuses(raw: Option<String>) -> Result<Vec<IncidentStatus>, ApiError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };

    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            status_from_str(s).map_err(|_| ApiError::BadRequest(format!("unknown status `{s}`")))
        })
        .collect()
}

fn status_from_str(s: &str) -> Result<IncidentStatus, ()> {
    match s.to_ascii_lowercase().as_str() {
        "open" => Ok(IncidentStatus::Open),
        "acknowledged" => Ok(IncidentStatus::Acknowledged),
        "resolving" => Ok(IncidentStatus::Resolving),
        "resolved" => Ok(IncidentStatus::Resolved),
        "suppressed" => Ok(IncidentStatus::Suppressed),
        _ => Err(()),
    }
}

#[openapi(tag = "Incidents")]
#[get("/incidents?<status>&<page>&<size>")]
pub async fn list_incidents(
    pipeline: &State<Arc<Pipeline>>,
    status: Option<String>,
    page: Option<i64>,
    size: Option<i64>,
) -> Result<Json<PaginatedResponse<Incident>>, ApiError> {
    let statuses = parse_statuses(status)?;
    let page = page.unwrap_or(1);
    let size = size.unwrap_or(25);

    let (incidents, total) = pipeline.incidents.list(&statuses, page, size).await?;
    Ok(Json(PaginatedResponse::new(incidents, page, size, total)))
}

#[openapi(tag = "Incidents")]
#[get("/incidents/<id>")]
pub async fn get_incident(
    pipeline: &State<Arc<Pipeline>>,
    id: String,
) -> Result<Json<ApiResponse<IncidentDetail>>, ApiError> {
    let id = Uuid::from_str(&id).map_err(|_| ApiError::BadRequest("invalid id".to_string()))?;

    let incident = pipeline
        .incidents
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("incident {id} not found")))?;
    let events = pipeline.incidents.linked_events(id).await?;

    Ok(Json(ApiResponse::new(IncidentDetail { incident, events })))
}
