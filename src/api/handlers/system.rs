//! System endpoints: health check.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use utoipa::ToSchema;

use crate::app_state::AppState;

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
struct HealthResponse {
    status: String,
    service: String,
    mqtt: bool,
    connections: usize,
    dropped_broadcasts: u64,
    timestamp: String,
}

/// `GET /health`: Relay health status.
#[utoipa::path(
    get,
    path = "/health",
    tag = "System",
    summary = "Health check",
    description = "Reports broker connectivity, the number of connected clients and how many broadcasts were shed. Degraded while the broker is unreachable.",
    responses(
        (status = 200, description = "Relay is healthy", body = HealthResponse),
        (status = 503, description = "Broker is unreachable", body = HealthResponse),
    )
)]
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mqtt = state.broker.is_connected();
    let (status, label) = if mqtt {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    (
        status,
        Json(HealthResponse {
            status: label.to_string(),
            service: env!("CARGO_PKG_NAME").to_string(),
            mqtt,
            connections: state.broadcaster.active_count().await,
            dropped_broadcasts: state.broadcaster.dropped_count(),
            timestamp: Utc::now().to_rfc3339(),
        }),
    )
}

/// System routes mounted at the root level (not under /api/v1).
pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health_handler))
}
