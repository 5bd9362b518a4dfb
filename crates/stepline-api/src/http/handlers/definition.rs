//! Workflow definition handlers: publish, list, fetch, archive.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use uuid::Uuid;

use stepline_types::workflow::DefinitionDraft;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct DefinitionQuery {
    /// Specific version to fetch; latest active when omitted.
    pub version: Option<u32>,
}

/// POST /api/v1/definitions - Validate and publish a definition draft.
///
/// Responds 400 with the complete violation list when the graph is invalid.
pub async fn publish_definition(
    State(state): State<AppState>,
    Json(draft): Json<DefinitionDraft>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let start = Instant::now();
    let request_id = uuid::Uuid::now_v7().to_string();

    let definition = state.definitions.publish(draft).await?;
    let elapsed = start.elapsed().as_millis() as u64;

    let definition_json = serde_json::to_value(&definition).unwrap();
    let resp = ApiResponse::success(definition_json, request_id, elapsed)
        .with_link("self", &format!("/api/v1/definitions/{}", definition.id))
        .with_link(
            "versions",
            &format!("/api/v1/definitions/{}/versions", definition.id),
        );

    Ok(Json(resp))
}

/// GET /api/v1/definitions - List the latest version of each definition.
pub async fn list_definitions(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<serde_json::Value>>>, AppError> {
    let start = Instant::now();
    let request_id = uuid::Uuid::now_v7().to_string();

    let definitions = state.definitions.list().await?;
    let elapsed = start.elapsed().as_millis() as u64;

    let definitions_json: Vec<serde_json::Value> = definitions
        .iter()
        .map(|d| serde_json::to_value(d).unwrap())
        .collect();

    let resp = ApiResponse::success(definitions_json, request_id, elapsed)
        .with_link("self", "/api/v1/definitions");

    Ok(Json(resp))
}

/// GET /api/v1/definitions/:id - Get a definition, latest active or pinned version.
pub async fn get_definition(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<DefinitionQuery>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let start = Instant::now();
    let request_id = uuid::Uuid::now_v7().to_string();

    let definition = state.definitions.get(&id, query.version).await?;
    let elapsed = start.elapsed().as_millis() as u64;

    let definition_json = serde_json::to_value(&definition).unwrap();
    let resp = ApiResponse::success(definition_json, request_id, elapsed)
        .with_link("self", &format!("/api/v1/definitions/{id}"))
        .with_link("versions", &format!("/api/v1/definitions/{id}/versions"))
        .with_link("instances", "/api/v1/instances");

    Ok(Json(resp))
}

/// GET /api/v1/definitions/:id/versions - All versions of a definition.
pub async fn list_versions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<serde_json::Value>>>, AppError> {
    let start = Instant::now();
    let request_id = uuid::Uuid::now_v7().to_string();

    let versions = state.definitions.versions(&id).await?;
    let elapsed = start.elapsed().as_millis() as u64;

    let versions_json: Vec<serde_json::Value> = versions
        .iter()
        .map(|d| serde_json::to_value(d).unwrap())
        .collect();

    let resp = ApiResponse::success(versions_json, request_id, elapsed)
        .with_link("self", &format!("/api/v1/definitions/{id}/versions"));

    Ok(Json(resp))
}

/// POST /api/v1/definitions/:id/archive - Archive the latest active version.
///
/// Running instances pinned to archived versions continue; only new starts
/// are disabled.
pub async fn archive_definition(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let start = Instant::now();
    let request_id = uuid::Uuid::now_v7().to_string();

    let definition = state.definitions.archive(&id).await?;
    let elapsed = start.elapsed().as_millis() as u64;

    let definition_json = serde_json::to_value(&definition).unwrap();
    let resp = ApiResponse::success(definition_json, request_id, elapsed)
        .with_link("self", &format!("/api/v1/definitions/{id}"));

    Ok(Json(resp))
}
