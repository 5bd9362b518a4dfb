//! Workflow instance handlers: start, advance, report results, cancel, inspect.

use std::collections::HashMap;
use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

fn default_actor() -> String {
    "api".to_string()
}

#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    pub definition_id: Uuid,
    #[serde(default)]
    pub bindings: HashMap<String, serde_json::Value>,
    #[serde(default = "default_actor")]
    pub actor: String,
}

#[derive(Debug, Deserialize)]
pub struct ReportResultRequest {
    pub step_id: String,
    #[serde(default = "default_actor")]
    pub actor: String,
    pub result: serde_json::Value,
}

#[derive(Debug, Deserialize, Default)]
pub struct CancelRequest {
    #[serde(default = "default_actor")]
    pub actor: String,
}

/// POST /api/v1/instances - Start an instance of the latest active version
/// and advance it as far as it will go.
pub async fn create_instance(
    State(state): State<AppState>,
    Json(body): Json<CreateInstanceRequest>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let start = Instant::now();
    let request_id = uuid::Uuid::now_v7().to_string();

    let instance = state
        .triggers
        .on_manual(body.definition_id, body.bindings, &body.actor)
        .await?;
    let elapsed = start.elapsed().as_millis() as u64;

    let instance_json = serde_json::to_value(&instance).unwrap();
    let resp = ApiResponse::success(instance_json, request_id, elapsed)
        .with_link("self", &format!("/api/v1/instances/{}", instance.id))
        .with_link("logs", &format!("/api/v1/instances/{}/logs", instance.id));

    Ok(Json(resp))
}

/// POST /api/v1/instances/:id/advance - Re-evaluate pending steps (timeouts,
/// joins). Idempotent when nothing is ready.
pub async fn advance_instance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let start = Instant::now();
    let request_id = uuid::Uuid::now_v7().to_string();

    let instance = state.engine.advance(id).await?;
    let elapsed = start.elapsed().as_millis() as u64;

    let instance_json = serde_json::to_value(&instance).unwrap();
    let resp = ApiResponse::success(instance_json, request_id, elapsed)
        .with_link("self", &format!("/api/v1/instances/{id}"));

    Ok(Json(resp))
}

/// POST /api/v1/instances/:id/report-result - Complete a pending task,
/// approval, or wait step with an external payload.
pub async fn report_result(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ReportResultRequest>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let start = Instant::now();
    let request_id = uuid::Uuid::now_v7().to_string();

    let instance = state
        .engine
        .report_result(id, &body.step_id, &body.actor, body.result)
        .await?;
    let elapsed = start.elapsed().as_millis() as u64;

    let instance_json = serde_json::to_value(&instance).unwrap();
    let resp = ApiResponse::success(instance_json, request_id, elapsed)
        .with_link("self", &format!("/api/v1/instances/{id}"))
        .with_link("logs", &format!("/api/v1/instances/{id}/logs"));

    Ok(Json(resp))
}

/// POST /api/v1/instances/:id/cancel - Cooperatively cancel a running
/// instance. The body may be `{}`; the actor defaults to "api".
pub async fn cancel_instance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<CancelRequest>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let start = Instant::now();
    let request_id = uuid::Uuid::now_v7().to_string();

    let instance = state.engine.cancel(id, &body.actor).await?;
    let elapsed = start.elapsed().as_millis() as u64;

    let instance_json = serde_json::to_value(&instance).unwrap();
    let resp = ApiResponse::success(instance_json, request_id, elapsed)
        .with_link("self", &format!("/api/v1/instances/{id}"));

    Ok(Json(resp))
}

/// GET /api/v1/instances/:id - Status, cursors, bindings, and step results.
pub async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let start = Instant::now();
    let request_id = uuid::Uuid::now_v7().to_string();

    let instance = state.engine.get(id).await?;
    let elapsed = start.elapsed().as_millis() as u64;

    let instance_json = serde_json::to_value(&instance).unwrap();
    let resp = ApiResponse::success(instance_json, request_id, elapsed)
        .with_link("self", &format!("/api/v1/instances/{id}"))
        .with_link("logs", &format!("/api/v1/instances/{id}/logs"))
        .with_link(
            "definition",
            &format!(
                "/api/v1/definitions/{}?version={}",
                instance.definition_id, instance.definition_version
            ),
        );

    Ok(Json(resp))
}

/// GET /api/v1/instances/:id/logs - Append-only execution log, in order.
pub async fn get_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<serde_json::Value>>>, AppError> {
    let start = Instant::now();
    let request_id = uuid::Uuid::now_v7().to_string();

    let logs = state.engine.logs(id).await?;
    let elapsed = start.elapsed().as_millis() as u64;

    let logs_json: Vec<serde_json::Value> = logs
        .iter()
        .map(|entry| serde_json::to_value(entry).unwrap())
        .collect();

    let resp = ApiResponse::success(logs_json, request_id, elapsed)
        .with_link("self", &format!("/api/v1/instances/{id}/logs"))
        .with_link("instance", &format!("/api/v1/instances/{id}"));

    Ok(Json(resp))
}
