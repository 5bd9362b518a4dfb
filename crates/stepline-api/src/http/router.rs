//! Axum router configuration with middleware.
//!
//! All routes are under `/api/v1/`.
//! Middleware: CORS, tracing.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Definitions
        .route(
            "/definitions",
            post(handlers::definition::publish_definition)
                .get(handlers::definition::list_definitions),
        )
        .route("/definitions/{id}", get(handlers::definition::get_definition))
        .route(
            "/definitions/{id}/versions",
            get(handlers::definition::list_versions),
        )
        .route(
            "/definitions/{id}/archive",
            post(handlers::definition::archive_definition),
        )
        // Instances
        .route("/instances", post(handlers::instance::create_instance))
        .route("/instances/{id}", get(handlers::instance::get_instance))
        .route(
            "/instances/{id}/advance",
            post(handlers::instance::advance_instance),
        )
        .route(
            "/instances/{id}/report-result",
            post(handlers::instance::report_result),
        )
        .route(
            "/instances/{id}/cancel",
            post(handlers::instance::cancel_instance),
        )
        .route("/instances/{id}/logs", get(handlers::instance::get_logs))
        // Events
        .route("/events", post(handlers::event::dispatch_event));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Simple health check endpoint.
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
