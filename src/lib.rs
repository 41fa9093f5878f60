//! # telemetry-relay
//!
//! WebSocket relay between browser clients and an MQTT device fabric.
//!
//! Clients subscribe to broker topics, publish commands to devices, and
//! receive every fleet-wide telemetry event over a single WebSocket. The
//! relay also keeps the latest mmWave radar frame per coordinator for
//! on-demand queries.
//!
//! ## Architecture
//!
//! ```text
//! Browser clients (WebSocket, HTTP)
//!     │
//!     ├── WS session loop (ws/)  ── TopicSubscriptionManager ──┐
//!     ├── REST handlers (api/)   ── LatestValueCache           │
//!     │                                                        │
//!     ├── ConnectionBroadcaster (ws/) ◄── TelemetryIngestor ◄──┤
//!     │                                                        │
//!     └── BrokerClient (broker/): rumqttc or in-process loopback
//!                                                              │
//! MQTT broker ◄──────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod app_state;
pub mod broker;
pub mod config;
pub mod domain;
pub mod error;
pub mod ingest;
pub mod ws;
