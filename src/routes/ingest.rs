//! Ingestion status endpoints.

use crate::error::ApiError;
use crate::models::{ApiResponse, FolderCursor};
use crate::pipeline::Pipeline;
use rocket::State;
use rocket::serde::json::Json;
use rocket_okapi::openapi;
use std::sync::Arc;

#[openapi(tag = "Ingest")]
#[get("/ingest/cursors")]
pub async fn list_cursors(
    pipeline: &State<Arc<Pipeline>>,
) -> Result<Json<ApiResponse<Vec<FolderCursor>>>, ApiError> {
    let cursors = pipeline.cursors.list().await?;
    Ok(Json(ApiResponse::new(cursors)))
}
