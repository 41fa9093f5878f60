//! Client-facing wire protocol: inbound requests and outbound envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::QoS;

/// Request kinds a client may send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Start receiving messages for a topic.
    Subscribe,
    /// Stop receiving messages for a topic.
    Unsubscribe,
    /// Publish a payload to a topic.
    Publish,
    /// Anything else, including a missing `type`.
    #[default]
    #[serde(other)]
    Unknown,
}

/// A decoded client request.
///
/// ```json
/// {"type": "publish", "topic": "site/s1/node/n1/cmd", "payload": {"cmd": "off"}, "qos": 1}
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ClientRequest {
    /// Request kind discriminator.
    #[serde(rename = "type", default)]
    pub kind: RequestKind,
    /// Target topic; `None` when omitted or `null`.
    #[serde(default)]
    pub topic: Option<String>,
    /// Publish payload, either a string sent verbatim or any JSON value.
    #[serde(default)]
    pub payload: Option<Value>,
    /// Publish QoS level as sent; see [`ClientRequest::qos`].
    #[serde(default)]
    pub qos: Option<Value>,
}

impl ClientRequest {
    /// Target topic, empty when omitted or `null`.
    #[must_use]
    pub fn topic(&self) -> &str {
        self.topic.as_deref().unwrap_or_default()
    }

    /// Requested QoS. A missing or `null` level means 0, and numeric
    /// strings such as `"1"` are accepted. Returns `None` for anything that
    /// is not a level from 0 to 2.
    #[must_use]
    pub fn qos(&self) -> Option<QoS> {
        let level = match &self.qos {
            None | Some(Value::Null) => 0,
            Some(Value::Number(n)) => n.as_u64()?,
            Some(Value::String(s)) => s.trim().parse().ok()?,
            Some(_) => return None,
        };
        u8::try_from(level).ok().and_then(QoS::from_level)
    }
}

/// Envelope sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A subscribe request succeeded (or was already in place).
    Subscribed {
        /// Subscribed topic.
        topic: String,
    },
    /// An unsubscribe request completed.
    Unsubscribed {
        /// Unsubscribed topic.
        topic: String,
    },
    /// A publish request was accepted by the broker.
    Published {
        /// Destination topic.
        topic: String,
    },
    /// A broker message on a subscribed topic.
    Message {
        /// Concrete topic the message arrived on.
        topic: String,
        /// Decoded JSON payload, or the raw text if it was not JSON.
        payload: serde_json::Value,
        /// Relay receive time in milliseconds since the epoch.
        timestamp: i64,
    },
    /// A request could not be served.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

impl ServerMessage {
    /// Builds an error envelope.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Builds a message envelope stamped with the current time, decoding
    /// `payload` as JSON and falling back to (lossy) UTF-8 text.
    #[must_use]
    pub fn message(topic: impl Into<String>, payload: &[u8]) -> Self {
        let payload = serde_json::from_slice(payload)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()));
        Self::Message {
            topic: topic.into(),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}
