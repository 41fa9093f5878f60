//! Relay error types.
//!
//! [`RelayError`] is the error type surfaced by the HTTP layer and maps each
//! variant to a status code and structured JSON body. [`BrokerError`] and
//! [`TransportError`] belong to the two collaborators the relay sits between:
//! the publish/subscribe broker and a client's duplex channel.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

/// Structured JSON error response body.
///
/// All HTTP error responses follow this shape:
/// ```json
/// {
///   "error": {
///     "code": 1001,
///     "message": "invalid request: site_id must not be empty"
///   }
/// }
/// ```
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Structured error payload.
    pub error: ErrorBody,
}

/// Inner error body with numeric code and human-readable message.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    /// Numeric error code.
    pub code: u32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Failures reported by the publish/subscribe broker client.
///
/// Never connection-fatal: they are returned to the requesting client as an
/// error envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The broker client is not connected.
    #[error("broker not connected")]
    NotConnected,

    /// A subscribe request was rejected.
    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe {
        /// Topic filter that failed.
        topic: String,
        /// Broker-provided reason.
        reason: String,
    },

    /// An unsubscribe request was rejected.
    #[error("unsubscribe from {topic} failed: {reason}")]
    Unsubscribe {
        /// Topic filter that failed.
        topic: String,
        /// Broker-provided reason.
        reason: String,
    },

    /// A publish request was rejected.
    #[error("publish to {topic} failed: {reason}")]
    Publish {
        /// Destination topic.
        topic: String,
        /// Broker-provided reason.
        reason: String,
    },

    /// The topic or filter is not valid for the broker.
    #[error("invalid topic: {0}")]
    InvalidTopic(String),
}

/// Failures writing to a client's duplex channel.
///
/// Always fatal for that one connection and nothing else.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection was already closed.
    #[error("connection closed")]
    Closed,

    /// A write did not complete within the write deadline.
    #[error("write timed out after {0} ms")]
    Timeout(u64),

    /// The underlying write failed.
    #[error("write failed: {0}")]
    Write(String),

    /// The value could not be serialized to a frame.
    #[error("serialization failed: {0}")]
    Serialize(String),
}

/// Server-side error enum with HTTP status code mapping.
///
/// # Error Code Ranges
///
/// | Range     | Category   | HTTP Status               |
/// |-----------|------------|---------------------------|
/// | 1000–1999 | Validation | 400 Bad Request           |
/// | 3000–3999 | Server     | 500 Internal Server Error |
///
/// Broker failures never reach HTTP: the only HTTP route touching the broker
/// (`/health`) reports connectivity in its body.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Request validation failed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::InvalidRequest(_) => 1001,
            Self::Config(_) => 3001,
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.error_code(),
                message: self.to_string(),
                details: None,
            },
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
    }
}
