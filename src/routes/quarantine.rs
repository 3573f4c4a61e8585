//! Quarantine review endpoints. Listing and review decisions are the
//! only write actions the HTTP surface allows; re-dispatch after an
//! approval is explicit.

use crate::error::ApiError;
use crate::models::{ApiResponse, PaginatedResponse, QuarantineEvent, ReviewOutcome};
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
pub struct ReviewRequest {
    /// `approved`, `rejected`, or `edited`.
    pub outcome: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ReviewResponse {
    pub id: Uuid,
    pub outcome: ReviewOutcome,
    /// Whether the source email was re-queued for parsing.
    pub redispatched: bool,
}

#[openapi(tag = "Quarantine")]
#[get("/quarantine?<page>&<size>")]
pub async fn list_quarantine(
    pipeline: &State<Arc<Pipeline>>,
    page: Option<i64>,
    size: Option<i64>,
) -> Result<Json<PaginatedResponse<QuarantineEvent>>, ApiError> {
    let page = page.unwrap_or(1);
    let size = size.unwrap_or(25);

    let (entries, total) = pipeline.quarantine.list_unreviewed(page, size).await?;
    Ok(Json(PaginatedResponse::new(entries, page, size, total)))
}

#[openapi(tag = "Quarantine")]
#[post("/quarantine/<id>/review", data = "<request>")]
pub async fn review_quarantine(
    pipeline: &State<Arc<Pipeline>>,
    id: String,
    request: Json<ReviewRequest>,
) -> Result<Json<ApiResponse<ReviewResponse>>, ApiError> {
    let id = Uuid::from_str(&id).map_err(|_| ApiError::BadRequest("invalid id".to_string()))?;

    let outcome = match request.outcome.to_ascii_lowercase().as_str() {
        "approved" => ReviewOutcome::Approved,
        "rejected" => ReviewOutcome::Rejected,
        "edited" => ReviewOutcome::Edited,
        other => {
            return Err(ApiError::BadRequest(format!(
                "unknown review outcome `{other}`"
            )));
        }
    };

    let entry = pipeline
        .quarantine
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("quarantine entry {id} not found")))?;

    let updated = pipeline.quarantine.review(id, outcome).await?;
    if !updated {
        return Err(ApiError::Conflict("entry already reviewed".to_string()));
    }

    // An approval re-dispatches the email through the parser so the
    // (possibly newly learned) rules get another chance.
    let redispatched = outcome == ReviewOutcome::Approved;
    if redispatched {
        pipeline.handle_email(entry.raw_email_id).await;
    }

    Ok(Json(ApiResponse::new(ReviewResponse {
        id,
        outcome,
        redispatched,
    })))
}
