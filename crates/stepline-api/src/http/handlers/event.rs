//! External event ingestion for event-triggered workflows.

use std::time::Instant;

use axum::Json;
use axum::extract::State;
use serde::Deserialize;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EventRequest {
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// POST /api/v1/events - Dispatch an event against all active definitions.
///
/// Returns the instances spawned by matching event triggers; an event
/// matching nothing returns an empty list, not an error.
pub async fn dispatch_event(
    State(state): State<AppState>,
    Json(body): Json<EventRequest>,
) -> Result<Json<ApiResponse<Vec<serde_json::Value>>>, AppError> {
    let start = Instant::now();
    let request_id = uuid::Uuid::now_v7().to_string();

    let spawned = state
        .triggers
        .on_event(&body.event_type, &body.payload)
        .await?;
    let elapsed = start.elapsed().as_millis() as u64;

    let spawned_json: Vec<serde_json::Value> = spawned
        .iter()
        .map(|instance| serde_json::to_value(instance).unwrap())
        .collect();

    let resp = ApiResponse::success(spawned_json, request_id, elapsed)
        .with_link("self", "/api/v1/events");

    Ok(Json(resp))
}
