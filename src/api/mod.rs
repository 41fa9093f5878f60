//! HTTP layer: REST handlers, WebSocket routes and router composition.
//!
//! REST endpoints live under `/api/v1` except `/health`. The WebSocket
//! upgrade is served on both `/ws` and `/mqtt`.

pub mod handlers;
pub mod openapi;

use std::time::Duration;

use axum::Router;
use axum::routing::get;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;
use crate::ws::handler::ws_handler;

/// Upper bound for a single REST request.
const REST_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the REST router (health and `/api/v1`).
pub fn build_router() -> Router<AppState> {
    Router::new()
        .nest("/api/v1", handlers::routes())
        .merge(handlers::system::routes())
}

/// Builds the complete application: REST routes, WebSocket routes, the
/// OpenAPI UI when enabled, and the HTTP middleware stack.
pub fn build_app(state: AppState) -> Router {
    let router = build_router()
        .layer(TimeoutLayer::new(REST_TIMEOUT))
        .route("/ws", get(ws_handler))
        .route("/mqtt", get(ws_handler));

    #[cfg(feature = "swagger-ui")]
    let router = {
        use utoipa::OpenApi;
        router.merge(
            utoipa_swagger_ui::SwaggerUi::new("/swagger-ui")
                .url("/api-docs/openapi.json", openapi::ApiDoc::openapi()),
        )
    };

    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
