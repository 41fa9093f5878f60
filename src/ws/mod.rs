//! WebSocket layer: client sessions, topic subscriptions and fleet-wide
//! broadcast.
//!
//! The endpoints at `/ws` and `/mqtt` let browser clients subscribe to broker
//! topics, publish to them, and receive every telemetry event the relay
//! broadcasts.

pub mod broadcaster;
pub mod connection;
pub mod handler;
pub mod messages;
pub mod sink;
pub mod subscription;

pub use broadcaster::{BroadcasterConfig, ConnectionBroadcaster};
pub use sink::ConnectionSink;
