//! Latest mmWave radar frame per coordinator.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};

use crate::app_state::AppState;
use crate::domain::{DeviceKey, MmwaveFrame};
use crate::error::{ErrorResponse, RelayError};

/// `GET /radar/{site_id}/{coord_id}`: Latest radar frame.
///
/// # Errors
///
/// Returns [`RelayError::InvalidRequest`] when an id contains an MQTT
/// wildcard.
#[utoipa::path(
    get,
    path = "/api/v1/radar/{site_id}/{coord_id}",
    tag = "Radar",
    summary = "Latest radar frame",
    description = "Returns the most recent mmWave frame reported by the coordinator. A coordinator that has not reported yet yields an empty frame with no presence and no targets.",
    params(
        ("site_id" = String, Path, description = "Site identifier"),
        ("coord_id" = String, Path, description = "Coordinator identifier"),
    ),
    responses(
        (status = 200, description = "Latest or empty frame", body = MmwaveFrame),
        (status = 400, description = "Invalid identifier", body = ErrorResponse),
    )
)]
pub async fn latest_frame(
    State(state): State<AppState>,
    Path((site_id, coord_id)): Path<(String, String)>,
) -> Result<Json<MmwaveFrame>, RelayError> {
    for (name, id) in [("site_id", &site_id), ("coord_id", &coord_id)] {
        if id.contains(['+', '#']) {
            return Err(RelayError::InvalidRequest(format!(
                "{name} must not contain wildcards"
            )));
        }
    }

    let key = DeviceKey::new(site_id.as_str(), coord_id.as_str());
    let frame = match state.radar_cache.get(&key).await {
        Some(frame) => MmwaveFrame::clone(&frame),
        None => MmwaveFrame::empty(&site_id, &coord_id),
    };
    Ok(Json(frame))
}

/// Radar routes, mounted under `/api/v1`.
pub fn routes() -> Router<AppState> {
    Router::new().route("/radar/{site_id}/{coord_id}", get(latest_frame))
}
