//! OpenAPI document for the REST surface.

use utoipa::OpenApi;

use super::handlers::{radar, system};

/// OpenAPI description of the relay's HTTP endpoints.
///
/// The WebSocket endpoints are not described here.
#[derive(Debug, OpenApi)]
#[openapi(
    info(
        title = "telemetry-relay",
        description = "WebSocket relay between browser clients and an MQTT device fabric."
    ),
    paths(system::health_handler, radar::latest_frame),
    tags(
        (name = "System", description = "Service health"),
        (name = "Radar", description = "Latest mmWave frames per coordinator"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_rest_paths() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/health"));
        assert!(doc.paths.paths.contains_key("/api/v1/radar/{site_id}/{coord_id}"));
    }
}
