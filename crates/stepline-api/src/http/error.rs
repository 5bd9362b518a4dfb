//! Application error type mapping to HTTP status codes and envelope format.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use stepline_core::workflow::{EngineError, StoreError, TriggerError};

use crate::http::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Definition store errors (publish validation, lookup).
    Store(StoreError),
    /// Execution engine errors.
    Engine(EngineError),
    /// Trigger dispatch errors.
    Trigger(TriggerError),
    /// Request-level validation error.
    Validation(String),
    /// Generic internal error.
    Internal(String),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        AppError::Store(e)
    }
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        AppError::Engine(e)
    }
}

impl From<TriggerError> for AppError {
    fn from(e: TriggerError) -> Self {
        AppError::Trigger(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Publish validation failures carry the complete violation list so
        // clients can fix everything in one round trip.
        if let AppError::Store(StoreError::Validation(violations)) = &self {
            let details = serde_json::to_value(violations).unwrap_or(serde_json::Value::Null);
            let mut resp = ApiResponse::error(
                "VALIDATION_ERROR",
                &format!("definition has {} violation(s)", violations.len()),
                String::new(),
                0,
            );
            resp.errors[0].details = Some(details);
            return resp.into_response();
        }

        let (status, code, message) = match &self {
            AppError::Store(StoreError::NotFound) => (
                StatusCode::NOT_FOUND,
                "DEFINITION_NOT_FOUND",
                "Workflow definition not found".to_string(),
            ),
            AppError::Store(StoreError::Parse(msg)) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }
            AppError::Store(e) => (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR", e.to_string()),
            AppError::Engine(e) => engine_status(e),
            AppError::Trigger(TriggerError::NoSuchTrigger(id, kind)) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                format!("definition {id} has no {kind} trigger"),
            ),
            AppError::Trigger(TriggerError::Engine(e)) => engine_status(e),
            AppError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }
            AppError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone())
            }
        };

        let body = json!({
            "data": null,
            "meta": {
                "request_id": "",
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "response_time_ms": 0
            },
            "errors": [{
                "code": code,
                "message": message,
            }]
        });

        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

/// Map an engine error to its HTTP status, code, and message.
fn engine_status(e: &EngineError) -> (StatusCode, &'static str, String) {
    match e {
        EngineError::DefinitionNotFound => (
            StatusCode::NOT_FOUND,
            "DEFINITION_NOT_FOUND",
            "No active workflow definition found".to_string(),
        ),
        EngineError::InstanceNotFound => (
            StatusCode::NOT_FOUND,
            "INSTANCE_NOT_FOUND",
            "Workflow instance not found".to_string(),
        ),
        EngineError::MissingRequiredVariable(_) | EngineError::TypeMismatch { .. } => {
            (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string())
        }
        EngineError::InstanceNotRunning(_) => {
            (StatusCode::CONFLICT, "INSTANCE_NOT_RUNNING", e.to_string())
        }
        EngineError::StepNotActive(_) => (StatusCode::CONFLICT, "STEP_NOT_ACTIVE", e.to_string()),
        EngineError::Repository(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "ENGINE_ERROR", e.to_string())
        }
    }
}
