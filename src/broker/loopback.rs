//! In-process broker.
//!
//! [`LoopbackBroker`] routes published messages straight back to local
//! subscribers using the same [`SubscriptionRouter`] as the MQTT client. It
//! backs `MQTT_BROKER=memory://` for running the relay without a broker.
//! Brokers built with [`LoopbackBroker::recording`] also keep every call
//! they receive so tests can inspect broker traffic.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    BrokerClient, BrokerMessage, MessageSink, QoS, SubscriptionHandle, SubscriptionRouter, topic,
};
use crate::error::BrokerError;

/// One call made against the loopback broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    /// `subscribe(topic, qos)`.
    Subscribe {
        /// Topic filter.
        topic: String,
        /// Requested QoS.
        qos: QoS,
    },
    /// `unsubscribe(topic)`.
    Unsubscribe {
        /// Topic filter.
        topic: String,
    },
    /// `publish(topic, qos, retain, payload)`.
    Publish {
        /// Destination topic.
        topic: String,
        /// Requested QoS.
        qos: QoS,
        /// Retain flag.
        retain: bool,
        /// Payload bytes.
        payload: Vec<u8>,
    },
}

/// Broker that lives entirely inside the process.
#[derive(Debug)]
pub struct LoopbackBroker {
    router: SubscriptionRouter,
    connected: AtomicBool,
    rejected: Mutex<HashSet<String>>,
    calls: Option<Mutex<Vec<BrokerCall>>>,
}

impl LoopbackBroker {
    /// Creates a connected loopback broker that keeps no call log.
    #[must_use]
    pub fn new(subscription_queue_capacity: usize) -> Self {
        Self {
            router: SubscriptionRouter::new(subscription_queue_capacity),
            connected: AtomicBool::new(true),
            rejected: Mutex::new(HashSet::new()),
            calls: None,
        }
    }

    /// Creates a connected loopback broker that records every call,
    /// payloads included, for inspection with [`LoopbackBroker::calls`].
    #[must_use]
    pub fn recording() -> Self {
        Self {
            calls: Some(Mutex::new(Vec::new())),
            ..Self::default()
        }
    }

    /// Routes a message to local subscribers as if a device had published
    /// it, without recording a call. Returns the number of matching
    /// subscriptions.
    pub async fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> usize {
        let message = BrokerMessage {
            topic: topic.to_string(),
            payload: payload.into(),
        };
        self.router.dispatch(&message).await
    }

    /// Marks the broker as up or down. While down, publishes fail with
    /// [`BrokerError::NotConnected`].
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Makes subscribe and publish requests on `topic` fail.
    pub async fn reject(&self, topic: &str) {
        self.rejected.lock().await.insert(topic.to_string());
    }

    /// Returns every call received so far, oldest first. Always empty
    /// unless the broker was built with [`LoopbackBroker::recording`].
    pub async fn calls(&self) -> Vec<BrokerCall> {
        match &self.calls {
            Some(calls) => calls.lock().await.clone(),
            None => Vec::new(),
        }
    }

    /// Returns the number of active local subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.router.len().await
    }

    async fn record(&self, call: impl FnOnce() -> BrokerCall) {
        if let Some(calls) = &self.calls {
            calls.lock().await.push(call());
        }
    }

    async fn is_rejected(&self, topic: &str) -> bool {
        self.rejected.lock().await.contains(topic)
    }
}

impl Default for LoopbackBroker {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl BrokerClient for LoopbackBroker {
    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        sink: Arc<dyn MessageSink>,
    ) -> Result<SubscriptionHandle, BrokerError> {
        self.record(|| BrokerCall::Subscribe {
            topic: topic.to_string(),
            qos,
        })
        .await;
        topic::validate_filter(topic)?;
        if self.is_rejected(topic).await {
            return Err(BrokerError::Subscribe {
                topic: topic.to_string(),
                reason: "not authorized".to_string(),
            });
        }
        Ok(self.router.add(topic, qos, sink).await.handle)
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), BrokerError> {
        self.record(|| BrokerCall::Unsubscribe {
            topic: handle.topic().to_string(),
        })
        .await;
        self.router.remove(handle).await;
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        self.record(|| BrokerCall::Publish {
            topic: topic.to_string(),
            qos,
            retain,
            payload: payload.clone(),
        })
        .await;
        topic::validate_topic_name(topic)?;
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        if self.is_rejected(topic).await {
            return Err(BrokerError::Publish {
                topic: topic.to_string(),
                reason: "not authorized".to_string(),
            });
        }
        self.inject(topic, payload).await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
