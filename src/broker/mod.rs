//! Publish/subscribe broker abstraction.
//!
//! The relay never talks to a broker library directly. Everything goes
//! through [`BrokerClient`], and every subscription carries a
//! [`MessageSink`] capability that the broker layer invokes per message
//! without knowing anything about the connection behind it.
//!
//! Two implementations exist:
//!
//! - [`MqttBroker`](mqtt::MqttBroker): a `rumqttc` client shared by all
//!   connections.
//! - [`LoopbackBroker`](loopback::LoopbackBroker): an in-process broker for
//!   local runs (`MQTT_BROKER=memory://`) and tests.

mod acks;
pub mod loopback;
pub mod mqtt;
pub mod router;
pub mod topic;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

pub use loopback::LoopbackBroker;
pub use mqtt::MqttBroker;
pub use router::SubscriptionRouter;

/// Broker delivery assurance level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    /// Fire and forget.
    #[default]
    AtMostOnce,
    /// Acknowledged delivery, duplicates possible.
    AtLeastOnce,
    /// Exactly one delivery.
    ExactlyOnce,
}

impl QoS {
    /// Parses a numeric QoS level (`0`, `1` or `2`).
    #[must_use]
    pub const fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }

    /// Returns the numeric QoS level.
    #[must_use]
    pub const fn level(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        Self::from_level(level).ok_or_else(|| format!("invalid qos level {level}"))
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos.level()
    }
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => Self::AtMostOnce,
            QoS::AtLeastOnce => Self::AtLeastOnce,
            QoS::ExactlyOnce => Self::ExactlyOnce,
        }
    }
}

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Concrete topic the message was published on.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

/// Handle for one local subscription, returned by
/// [`BrokerClient::subscribe`] and required by
/// [`BrokerClient::unsubscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    topic: String,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: u64, topic: impl Into<String>) -> Self {
        Self {
            id,
            topic: topic.into(),
        }
    }

    /// Returns the process-unique subscription id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Returns the topic filter this subscription was made with.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.topic, self.id)
    }
}

/// Capability invoked for each message matching a subscription.
///
/// Messages for one subscription are delivered one at a time, in broker
/// order.
#[async_trait]
pub trait MessageSink: Send + Sync + fmt::Debug {
    /// Handles one message.
    async fn deliver(&self, message: BrokerMessage);
}

/// Client interface to the shared publish/subscribe broker.
#[async_trait]
pub trait BrokerClient: Send + Sync + fmt::Debug {
    /// Subscribes `sink` to `topic` (an MQTT topic filter).
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidTopic`] for malformed filters and
    /// [`BrokerError::Subscribe`] when the broker rejects the request.
    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        sink: Arc<dyn MessageSink>,
    ) -> Result<SubscriptionHandle, BrokerError>;

    /// Cancels a subscription. Messages stop reaching its sink immediately,
    /// even when the broker-level request fails.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Unsubscribe`] when the broker rejects the
    /// request.
    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), BrokerError>;

    /// Publishes `payload` on `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NotConnected`] while the broker is unreachable,
    /// [`BrokerError::InvalidTopic`] for topics containing wildcards and
    /// [`BrokerError::Publish`] when the request is rejected.
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError>;

    /// Reports whether the broker connection is currently up.
    fn is_connected(&self) -> bool;
}
