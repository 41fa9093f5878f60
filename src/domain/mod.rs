//! Domain layer: identities, telemetry types and the latest-value cache.
//!
//! This module contains the relay's data model: connection identity, the
//! `(site, device)` cache key, device telemetry in both its broker and
//! client-facing shapes, and the latest-sample store read by the query API.

pub mod connection_id;
pub mod device_key;
pub mod latest_cache;
pub mod telemetry;

pub use connection_id::ConnectionId;
pub use device_key::DeviceKey;
pub use latest_cache::LatestValueCache;
pub use telemetry::{MmwaveFrame, TelemetryEvent};

/// Latest radar frame per `(site, coordinator)`.
pub type RadarCache = LatestValueCache<MmwaveFrame>;
