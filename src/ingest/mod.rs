//! Telemetry ingestion: device topics in, broadcasts and cache writes out.
//!
//! [`TelemetryIngestor`] subscribes to the device telemetry topics through
//! the shared broker client, reshapes each report into a
//! [`TelemetryEvent`](crate::domain::TelemetryEvent) for every connected
//! client, and keeps the latest mmWave frame per coordinator in the radar
//! cache.

pub mod device_topic;
pub mod ingestor;

pub use device_topic::DeviceTopic;
pub use ingestor::{INGEST_FILTERS, TelemetryIngestor};
