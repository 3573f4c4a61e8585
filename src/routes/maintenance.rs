//! Maintenance window endpoints: listing plus manual create and
//! deactivate.

use crate::error::ApiError;
use crate::maintenance::scope::parse_selector_list;
use crate::models::{ApiResponse, MaintenanceWindow, SuppressMode};
use crate::pipeline::Pipeline;
use chrono::{DateTime, Utc};
use rocket::State;
use rocket::serde::json::Json;
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CreateWindowRequest {
    pub title: String,
    /// Selector list, e.g. `host=web-*; env=prod`.
    pub scope: String,
    /// `mute`, `downgrade`, or `digest`. Defaults to `mute`.
    #[serde(default)]
    pub mode: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    /// IANA zone label for display; instants above are UTC.
    #[serde(default)]
    pub timezone: Option<String>,
}

#[openapi(tag = "Maintenance")]
#[get("/maintenance/windows?<all>")]
pub async fn list_windows(
    pipeline: &State<Arc<Pipeline>>,
    all: Option<bool>,
) -> Result<Json<ApiResponse<Vec<MaintenanceWindow>>>, ApiError> {
    let windows = pipeline
        .maintenance
        .list(!all.unwrap_or(false))
        .await?;
    Ok(Json(ApiResponse::new(windows)))
}

#[openapi(tag = "Maintenance")]
#[post("/maintenance/windows", data = "<request>")]
pub async fn create_window(
    pipeline: &State<Arc<Pipeline>>,
    request: Json<CreateWindowRequest>,
) -> Result<Json<ApiResponse<MaintenanceWindow>>, ApiError> {
    if request.ends_at <= request.starts_at {
        return Err(ApiError::BadRequest(
            "window must end after it starts".to_string(),
        ));
    }

    let scope = parse_selector_list(&request.scope).map_err(ApiError::BadRequest)?;
    let mode = match &request.mode {
        Some(raw) => SuppressMode::from_token(raw)
            .ok_or_else(|| ApiError::BadRequest(format!("unknown mode `{raw}`")))?,
        None => SuppressMode::Mute,
    };

    let window = pipeline
        .maintenance
        .create_manual(
            &request.title,
            request.starts_at,
            request.ends_at,
            request.timezone.as_deref().unwrap_or("UTC"),
            scope,
            mode,
        )
        .await?;

    Ok(Json(ApiResponse::new(window)))
}

#[openapi(tag = "Maintenance")]
#[delete("/maintenance/windows/<id>")]
pub async fn deactivate_window(
    pipeline: &State<Arc<Pipeline>>,
    id: String,
) -> Result<Json<ApiResponse<bool>>, ApiError> {
    let id = Uuid::from_str(&id).map_err(|_| ApiError::BadRequest("invalid id".to_string()))?;

    let removed = pipeline.maintenance.deactivate(id).await?;
    if !removed {
        return Err(ApiError::NotFound(format!("window {id} not found")));
    }

    Ok(Json(ApiResponse::new(true)))
}
