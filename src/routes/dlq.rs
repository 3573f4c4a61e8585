//! Dead-letter queue endpoints: listing and explicit re-dispatch.

use crate::error::ApiError;
use crate::models::{ApiResponse, DeadLetterEntry, DeadLetterStatus, PaginatedResponse};
use crate::pipeline::Pipeline;
use rocket::State;
use rocket::serde::json::Json;
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct RedispatchResponse {
    pub id: Uuid,
    pub queued: bool,
}

fn parse_statuses(raw: Option<String>) -> Result<Vec<DeadLetterStatus>, ApiError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };

    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(DeadLetterStatus::Pending),
            "retrying" => Ok(DeadLetterStatus::Retrying),
            "failed" => Ok(DeadLetterStatus::Failed),
            "resolved" => Ok(DeadLetterStatus::Resolved),
            other => Err(ApiError::BadRequest(format!("unknown status `{other}`"))),
        })
        .collect()
}

#[openapi(tag = "DeadLetters")]
#[get("/dead-letters?<status>&<page>&<size>")]
pub async fn list_dead_letters(
    pipeline: &State<Arc<Pipeline>>,
    status: Option<String>,
    page: Option<i64>,
    size: Option<i64>,
) -> Result<Json<PaginatedResponse<DeadLetterEntry>>, ApiError> {
    let statuses = parse_statuses(status)?;
    let page = page.unwrap_or(1);
    let size = size.unwrap_or(25);

    let (entries, total) = pipeline.dlq.list(&statuses, page, size).await?;
    Ok(Json(PaginatedResponse::new(entries, page, size, total)))
}

/// Make a parked entry due immediately; the next sweep picks it up.
#[openapi(tag = "DeadLetters")]
#[post("/dead-letters/<id>/redispatch")]
pub async fn redispatch_dead_letter(
    pipeline: &State<Arc<Pipeline>>,
    id: String,
) -> Result<Json<ApiResponse<RedispatchResponse>>, ApiError> {
    let id = Uuid::from_str(&id).map_err(|_| ApiError::BadRequest("invalid id".to_string()))?;

    let queued = pipeline.dlq.redispatch(id).await?;
    if !queued {
        return Err(ApiError::NotFound(format!(
            "dead letter {id} not found or already resolved"
        )));
    }

    Ok(Json(ApiResponse::new(RedispatchResponse { id, queued })))
}
