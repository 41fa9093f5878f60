//! Device telemetry ingestor.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::DeviceTopic;
use crate::broker::{BrokerClient, BrokerMessage, MessageSink, QoS, SubscriptionHandle};
use crate::domain::telemetry::{
    CoordinatorTelemetry, CoordinatorTelemetryReport, NodeTelemetry, NodeTelemetryReport,
};
use crate::domain::{DeviceKey, MmwaveFrame, RadarCache, TelemetryEvent};
use crate::error::BrokerError;
use crate::ws::ConnectionBroadcaster;

/// Topic filters the ingestor subscribes to.
pub const INGEST_FILTERS: [&str; 3] = [
    "site/+/node/+/telemetry",
    "site/+/coord/+/telemetry",
    "site/+/coord/+/mmwave",
];

/// Turns device telemetry into client broadcasts and radar cache entries.
#[derive(Debug)]
pub struct TelemetryIngestor {
    broadcaster: ConnectionBroadcaster,
    radar_cache: Arc<RadarCache>,
}

impl TelemetryIngestor {
    /// Creates an ingestor feeding `broadcaster` and `radar_cache`.
    #[must_use]
    pub const fn new(broadcaster: ConnectionBroadcaster, radar_cache: Arc<RadarCache>) -> Self {
        Self {
            broadcaster,
            radar_cache,
        }
    }

    /// Subscribes the ingestor to every filter in [`INGEST_FILTERS`].
    ///
    /// # Errors
    ///
    /// Returns the first subscribe failure. Filters subscribed before it
    /// are released again.
    pub async fn start(
        self: Arc<Self>,
        broker: &dyn BrokerClient,
    ) -> Result<Vec<SubscriptionHandle>, BrokerError> {
        let mut handles = Vec::with_capacity(INGEST_FILTERS.len());
        for filter in INGEST_FILTERS {
            let sink = Arc::clone(&self) as Arc<dyn MessageSink>;
            match broker.subscribe(filter, QoS::AtLeastOnce, sink).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in &handles {
                        if let Err(e) = broker.unsubscribe(handle).await {
                            tracing::debug!(%handle, error = %e, "ingest rollback unsubscribe failed");
                        }
                    }
                    return Err(e);
                }
            }
        }
        tracing::info!(filters = ?INGEST_FILTERS, "telemetry ingestion started");
        Ok(handles)
    }

    /// Handles one device message and returns the event that was
    /// broadcast, or `None` if the topic or payload was not understood.
    pub async fn ingest(&self, message: &BrokerMessage) -> Option<TelemetryEvent> {
        let Some(device) = DeviceTopic::parse(&message.topic) else {
            tracing::debug!(topic = %message.topic, "ignoring non-telemetry topic");
            return None;
        };

        let event = match device {
            DeviceTopic::NodeTelemetry { node_id, .. } => {
                let report: NodeTelemetryReport = decode(message)?;
                TelemetryEvent::NodeTelemetry(NodeTelemetry::from_report(&node_id, report))
            }
            DeviceTopic::CoordinatorTelemetry { site_id, coord_id } => {
                let report: CoordinatorTelemetryReport = decode(message)?;
                TelemetryEvent::CoordinatorTelemetry(CoordinatorTelemetry::from_report(
                    &site_id, &coord_id, report,
                ))
            }
            DeviceTopic::Mmwave { site_id, coord_id } => {
                let mut frame: MmwaveFrame = decode(message)?;
                if frame.site_id.is_empty() {
                    frame.site_id.clone_from(&site_id);
                }
                if frame.coordinator_id.is_empty() {
                    frame.coordinator_id.clone_from(&coord_id);
                }
                self.radar_cache
                    .set(DeviceKey::new(site_id, coord_id), frame.clone())
                    .await;
                TelemetryEvent::MmwaveFrame(frame)
            }
        };

        self.broadcaster.broadcast(&event);
        Some(event)
    }
}

#[async_trait]
impl MessageSink for TelemetryIngestor {
    async fn deliver(&self, message: BrokerMessage) {
        self.ingest(&message).await;
    }
}

fn decode<T: DeserializeOwned>(message: &BrokerMessage) -> Option<T> {
    match serde_json::from_slice(&message.payload) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!(topic = %message.topic, error = %e, "skipping undecodable telemetry");
            None
        }
    }
}
