//! Per-connection topic subscriptions.
//!
//! [`TopicSubscriptionManager`] turns one client's subscribe, unsubscribe
//! and publish requests into broker calls and remembers which broker
//! subscriptions belong to the connection, so they can all be released when
//! it goes away.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::messages::ServerMessage;
use super::sink::ConnectionSink;
use crate::broker::{BrokerClient, BrokerMessage, MessageSink, QoS, SubscriptionHandle};
use crate::error::TransportError;

/// QoS used for client-requested subscriptions.
const SUBSCRIBE_QOS: QoS = QoS::AtLeastOnce;

/// Forwards broker messages on a subscribed topic to one connection as
/// `message` envelopes.
#[derive(Debug)]
pub struct TopicForwarder {
    sink: Arc<ConnectionSink>,
}

impl TopicForwarder {
    /// Creates a forwarder writing to `sink`.
    #[must_use]
    pub const fn new(sink: Arc<ConnectionSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl MessageSink for TopicForwarder {
    async fn deliver(&self, message: BrokerMessage) {
        let envelope = ServerMessage::message(message.topic, &message.payload);
        match self.sink.send_json(&envelope).await {
            Ok(()) | Err(TransportError::Closed) => {}
            Err(e) => {
                tracing::warn!(conn_id = %self.sink.id(), error = %e, "topic message write failed, closing connection");
                self.sink.close().await;
            }
        }
    }
}

/// Topic → broker subscription map for a single connection.
///
/// At most one broker subscription exists per topic.
#[derive(Debug)]
pub struct TopicSubscriptionManager {
    broker: Arc<dyn BrokerClient>,
    sink: Arc<ConnectionSink>,
    subscriptions: HashMap<String, SubscriptionHandle>,
}

impl TopicSubscriptionManager {
    /// Creates an empty manager for the connection behind `sink`.
    #[must_use]
    pub fn new(broker: Arc<dyn BrokerClient>, sink: Arc<ConnectionSink>) -> Self {
        Self {
            broker,
            sink,
            subscriptions: HashMap::new(),
        }
    }

    /// Subscribes the connection to `topic`.
    ///
    /// Already subscribed topics are acknowledged again without a broker
    /// call. A broker failure yields an error envelope and records nothing.
    pub async fn subscribe(&mut self, topic: &str) -> ServerMessage {
        if self.subscriptions.contains_key(topic) {
            return ServerMessage::Subscribed {
                topic: topic.to_string(),
            };
        }

        let forwarder = Arc::new(TopicForwarder::new(Arc::clone(&self.sink)));
        match self.broker.subscribe(topic, SUBSCRIBE_QOS, forwarder).await {
            Ok(handle) => {
                tracing::debug!(conn_id = %self.sink.id(), topic, "subscribed");
                self.subscriptions.insert(topic.to_string(), handle);
                ServerMessage::Subscribed {
                    topic: topic.to_string(),
                }
            }
            Err(e) => {
                tracing::warn!(conn_id = %self.sink.id(), topic, error = %e, "subscribe failed");
                ServerMessage::error(e.to_string())
            }
        }
    }

    /// Unsubscribes the connection from `topic`.
    ///
    /// Always acknowledged, including for topics that were never subscribed.
    /// The mapping is dropped even if the broker call fails, since the local
    /// route is already gone by then.
    pub async fn unsubscribe(&mut self, topic: &str) -> ServerMessage {
        if let Some(handle) = self.subscriptions.remove(topic) {
            if let Err(e) = self.broker.unsubscribe(&handle).await {
                tracing::warn!(conn_id = %self.sink.id(), topic, error = %e, "broker unsubscribe failed");
            } else {
                tracing::debug!(conn_id = %self.sink.id(), topic, "unsubscribed");
            }
        }
        ServerMessage::Unsubscribed {
            topic: topic.to_string(),
        }
    }

    /// Publishes `payload` on `topic`.
    ///
    /// A string payload is sent verbatim; any other JSON value (including a
    /// missing payload, sent as `null`) is serialized first.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Option<serde_json::Value>,
        qos: QoS,
    ) -> ServerMessage {
        let bytes = match payload {
            Some(serde_json::Value::String(text)) => text.into_bytes(),
            other => match serde_json::to_vec(&other) {
                Ok(bytes) => bytes,
                Err(_) => return ServerMessage::error("invalid payload"),
            },
        };

        tracing::debug!(conn_id = %self.sink.id(), topic, qos = qos.level(), bytes = bytes.len(), "publishing");
        match self.broker.publish(topic, qos, false, bytes).await {
            Ok(()) => ServerMessage::Published {
                topic: topic.to_string(),
            },
            Err(e) => {
                tracing::warn!(conn_id = %self.sink.id(), topic, error = %e, "publish failed");
                ServerMessage::error(e.to_string())
            }
        }
    }

    /// Releases every broker subscription held by this connection and
    /// returns how many there were. Individual failures are logged and
    /// skipped.
    pub async fn close_all(&mut self) -> usize {
        let count = self.subscriptions.len();
        for (topic, handle) in self.subscriptions.drain() {
            if let Err(e) = self.broker.unsubscribe(&handle).await {
                tracing::debug!(conn_id = %self.sink.id(), topic = %topic, error = %e, "cleanup unsubscribe failed");
            }
        }
        count
    }

    /// Returns `true` if the connection is subscribed to `topic`.
    #[must_use]
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.contains_key(topic)
    }

    /// Returns the number of subscribed topics.
    #[must_use]
    pub fn count(&self) -> usize {
        self.subscriptions.len()
    }
}
