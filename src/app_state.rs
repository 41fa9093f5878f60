//! Shared application state injected into all Axum handlers.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::broker::mqtt::MqttSettings;
use crate::broker::{BrokerClient, LoopbackBroker, MqttBroker};
use crate::config::{BrokerEndpoint, RelayConfig};
use crate::domain::RadarCache;
use crate::ws::{BroadcasterConfig, ConnectionBroadcaster};

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Broker client shared by every connection.
    pub broker: Arc<dyn BrokerClient>,
    /// Fleet-wide fan-out to connected clients.
    pub broadcaster: ConnectionBroadcaster,
    /// Latest mmWave frame per coordinator.
    pub radar_cache: Arc<RadarCache>,
    /// Per-write deadline for client connections.
    pub write_timeout: Duration,
}

impl AppState {
    /// Builds the state described by `config`: connects the configured
    /// broker and spawns the broadcaster's coordination loop.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn from_config(config: &RelayConfig) -> Self {
        let broker: Arc<dyn BrokerClient> = match &config.broker {
            BrokerEndpoint::Mqtt { host, port } => {
                let settings = MqttSettings {
                    host: host.clone(),
                    port: *port,
                    client_id: config.mqtt_client_id.clone(),
                    credentials: config
                        .mqtt_username
                        .clone()
                        .map(|user| (user, config.mqtt_password.clone())),
                    keep_alive: Duration::from_secs(config.mqtt_keep_alive_secs),
                    request_capacity: config.mqtt_request_capacity,
                    subscription_queue_capacity: config.subscription_queue_capacity,
                    ack_timeout: config.ack_timeout(),
                };
                let (broker, event_loop) = MqttBroker::connect(&settings);
                tokio::spawn(watch_event_loop(event_loop));
                broker
            }
            BrokerEndpoint::Loopback => {
                tracing::info!("using in-process loopback broker");
                Arc::new(LoopbackBroker::new(config.subscription_queue_capacity))
            }
        };

        let broadcaster = ConnectionBroadcaster::spawn(BroadcasterConfig {
            queue_capacity: config.broadcast_queue_capacity,
            connection_queue_capacity: config.connection_queue_capacity,
        });

        Self {
            broker,
            broadcaster,
            radar_cache: Arc::new(RadarCache::new()),
            write_timeout: config.write_timeout(),
        }
    }
}

/// Logs the end of the MQTT event loop task. It only ends by panicking or
/// being cancelled, after which no broker traffic flows.
async fn watch_event_loop(event_loop: JoinHandle<()>) {
    match event_loop.await {
        Ok(()) => tracing::error!("mqtt event loop exited"),
        Err(e) if e.is_panic() => tracing::error!(error = %e, "mqtt event loop panicked"),
        Err(e) => tracing::warn!(error = %e, "mqtt event loop cancelled"),
    }
}
