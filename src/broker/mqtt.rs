//! `rumqttc`-backed broker client shared by every connection.
//!
//! One [`rumqttc::AsyncClient`] serves all subscriptions. Local
//! subscriptions on the same filter share one broker-level subscription:
//! SUBSCRIBE is sent for the first, UNSUBSCRIBE only after the last is gone.
//! The event loop task re-subscribes every active filter on each `ConnAck`,
//! so subscriptions survive reconnects and may be made before the first
//! connection is up.
//!
//! `subscribe` and `publish` return once the broker has acknowledged the
//! request (SUBACK, PUBACK or PUBCOMP; QoS 0 publishes once written), or
//! fail after the configured acknowledgement timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::acks::{AckOutcome, AckTracker};
use super::{
    BrokerClient, BrokerMessage, MessageSink, QoS, SubscriptionHandle, SubscriptionRouter, topic,
};
use crate::error::BrokerError;

#[cfg(test)]
mod test_server;

/// Delay before polling again after an event loop error.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Connection settings for [`MqttBroker::connect`].
#[derive(Debug, Clone)]
pub struct MqttSettings {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// MQTT client identifier.
    pub client_id: String,
    /// Optional `(username, password)`.
    pub credentials: Option<(String, String)>,
    /// Keep alive interval.
    pub keep_alive: Duration,
    /// Capacity of the client request channel.
    pub request_capacity: usize,
    /// Per-subscription delivery queue capacity.
    pub subscription_queue_capacity: usize,
    /// How long subscribe and publish wait for the broker's answer.
    pub ack_timeout: Duration,
}

/// Shared MQTT broker client.
#[derive(Debug)]
pub struct MqttBroker {
    client: AsyncClient,
    router: SubscriptionRouter,
    connected: AtomicBool,
    acks: AckTracker,
    /// Held from a router change until the matching SUBSCRIBE/UNSUBSCRIBE
    /// is queued, so broker requests follow reference count changes.
    filters: Mutex<()>,
    /// Held while a publish waiter is registered and its request queued.
    publishes: Mutex<()>,
    ack_timeout: Duration,
}

impl MqttBroker {
    /// Creates the client and spawns its event loop task.
    ///
    /// The returned handle runs for the life of the process; the connection
    /// itself is established (and re-established) in the background.
    #[must_use]
    pub fn connect(settings: &MqttSettings) -> (Arc<Self>, JoinHandle<()>) {
        let mut options =
            MqttOptions::new(settings.client_id.clone(), settings.host.clone(), settings.port);
        options.set_keep_alive(settings.keep_alive);
        options.set_clean_session(true);
        if let Some((username, password)) = &settings.credentials {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, event_loop) = AsyncClient::new(options, settings.request_capacity.max(1));
        let broker = Arc::new(Self {
            client,
            router: SubscriptionRouter::new(settings.subscription_queue_capacity),
            connected: AtomicBool::new(false),
            acks: AckTracker::default(),
            filters: Mutex::new(()),
            publishes: Mutex::new(()),
            ack_timeout: settings.ack_timeout,
        });

        tracing::info!(
            host = %settings.host,
            port = settings.port,
            client_id = %settings.client_id,
            "connecting to mqtt broker"
        );
        let task = tokio::spawn(Arc::clone(&broker).run_event_loop(event_loop));

        (broker, task)
    }

    /// Sends SUBSCRIBE for `filter` and waits for its SUBACK.
    ///
    /// Callers hold `self.filters`.
    async fn request_subscribe(&self, filter: &str, qos: QoS) -> Result<(), BrokerError> {
        let failed = |reason: String| BrokerError::Subscribe {
            topic: filter.to_string(),
            reason,
        };

        let ack = self.acks.expect_subscribe().await;
        if let Err(e) = self.client.subscribe(filter, qos.into()).await {
            self.acks.forget_subscribe().await;
            return Err(failed(e.to_string()));
        }

        match tokio::time::timeout(self.ack_timeout, ack).await {
            Ok(Ok(AckOutcome::Accepted)) => Ok(()),
            Ok(Ok(AckOutcome::Refused)) => Err(failed("refused by broker".to_string())),
            Ok(Ok(AckOutcome::Lost) | Err(_)) => {
                Err(failed("connection lost before suback".to_string()))
            }
            Err(_) => Err(failed(format!(
                "no suback within {}ms",
                self.ack_timeout.as_millis()
            ))),
        }
    }

    /// Restores every active filter after a (re)connect.
    async fn resubscribe(self: Arc<Self>) {
        let _order = self.filters.lock().await;
        let filters = self.router.filters().await;
        tracing::info!(filters = filters.len(), "restoring mqtt subscriptions");
        for (filter, qos) in filters {
            if let Err(e) = self.request_subscribe(&filter, qos).await {
                tracing::warn!(filter = %filter, error = %e, "failed to restore subscription");
            }
        }
    }

    /// Drives the `rumqttc` event loop: tracks connectivity, matches
    /// acknowledgements, restores subscriptions after each `ConnAck` and
    /// routes incoming publishes.
    async fn run_event_loop(self: Arc<Self>, mut event_loop: EventLoop) {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    self.connected.store(true, Ordering::Release);
                    tracing::info!("mqtt connection established");
                    // restoring waits on the request channel this loop drains
                    tokio::spawn(Arc::clone(&self).resubscribe());
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = BrokerMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    };
                    let matched = self.router.dispatch(&message).await;
                    tracing::trace!(topic = %message.topic, matched, "mqtt message routed");
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => self.acks.on_suback(&ack).await,
                Ok(Event::Incoming(Packet::PubAck(ack))) => {
                    self.acks.on_publish_complete(ack.pkid).await;
                }
                Ok(Event::Incoming(Packet::PubComp(comp))) => {
                    self.acks.on_publish_complete(comp.pkid).await;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    self.connected.store(false, Ordering::Release);
                    self.acks.on_connection_lost().await;
                    tracing::info!("mqtt broker sent disconnect");
                }
                Ok(Event::Outgoing(outgoing)) => self.acks.on_outgoing(&outgoing).await,
                Ok(event) => {
                    tracing::trace!(?event, "mqtt event");
                }
                Err(e) => {
                    if self.connected.swap(false, Ordering::AcqRel) {
                        tracing::warn!(error = %e, "mqtt connection lost");
                    } else {
                        tracing::debug!(error = %e, "mqtt connection attempt failed");
                    }
                    self.acks.on_connection_lost().await;
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }
}

#[async_trait]
impl BrokerClient for MqttBroker {
    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        sink: Arc<dyn MessageSink>,
    ) -> Result<SubscriptionHandle, BrokerError> {
        topic::validate_filter(topic)?;

        let _order = self.filters.lock().await;
        let added = self.router.add(topic, qos, sink).await;
        if !added.first_for_filter {
            return Ok(added.handle);
        }
        if !self.is_connected() {
            tracing::debug!(topic, "broker offline, subscription deferred until connected");
            return Ok(added.handle);
        }

        if let Err(e) = self.request_subscribe(topic, qos).await {
            self.router.remove(&added.handle).await;
            return Err(e);
        }
        Ok(added.handle)
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), BrokerError> {
        let _order = self.filters.lock().await;
        let Some(last) = self.router.remove(handle).await else {
            return Ok(());
        };
        if !last || !self.is_connected() {
            return Ok(());
        }
        self.client
            .unsubscribe(handle.topic())
            .await
            .map_err(|e| BrokerError::Unsubscribe {
                topic: handle.topic().to_string(),
                reason: e.to_string(),
            })
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        topic::validate_topic_name(topic)?;
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        let failed = |reason: String| BrokerError::Publish {
            topic: topic.to_string(),
            reason,
        };

        let ack = {
            let _order = self.publishes.lock().await;
            let ack = self.acks.expect_publish().await;
            if let Err(e) = self.client.publish(topic, qos.into(), retain, payload).await {
                self.acks.forget_publish().await;
                return Err(failed(e.to_string()));
            }
            ack
        };

        match tokio::time::timeout(self.ack_timeout, ack).await {
            Ok(Ok(AckOutcome::Accepted)) => Ok(()),
            Ok(Ok(AckOutcome::Refused | AckOutcome::Lost) | Err(_)) => {
                Err(failed("connection lost before acknowledgement".to_string()))
            }
            Err(_) => Err(failed(format!(
                "no acknowledgement within {}ms",
                self.ack_timeout.as_millis()
            ))),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::test_server::{Received, ServerOptions, TestServer};
    use super::*;
    use tokio::sync::mpsc;

    #[derive(Debug)]
    struct ChannelSink(mpsc::UnboundedSender<BrokerMessage>);

    #[async_trait]
    impl MessageSink for ChannelSink {
        async fn deliver(&self, message: BrokerMessage) {
            let _ = self.0.send(message);
        }
    }

    fn sink() -> (Arc<dyn MessageSink>, mpsc::UnboundedReceiver<BrokerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelSink(tx)), rx)
    }

    fn connect(server: &TestServer, ack_timeout: Duration) -> Arc<MqttBroker> {
        let settings = MqttSettings {
            host: "127.0.0.1".to_string(),
            port: server.addr.port(),
            client_id: "relay-test".to_string(),
            credentials: None,
            keep_alive: Duration::from_secs(30),
            request_capacity: 16,
            subscription_queue_capacity: 16,
            ack_timeout,
        };
        let (broker, _event_loop) = MqttBroker::connect(&settings);
        broker
    }

    async fn connected(server: &TestServer) -> Arc<MqttBroker> {
        let broker = connect(server, Duration::from_secs(2));
        for _ in 0..100 {
            if broker.is_connected() {
                // let the ConnAck resubscribe pass finish first
                tokio::task::yield_now().await;
                drop(broker.filters.lock().await);
                return broker;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("broker never connected");
    }

    /// Waits until the server has handled every request queued so far.
    async fn settle(broker: &MqttBroker) {
        let Ok(()) = broker
            .publish("relay/settle", QoS::AtLeastOnce, false, Vec::new())
            .await
        else {
            panic!("settle publish failed");
        };
    }

    #[tokio::test]
    async fn subscribers_share_one_broker_subscription() {
        let mut server = TestServer::start(ServerOptions::default()).await;
        let broker = connected(&server).await;
        let (first_sink, mut first_rx) = sink();
        let (second_sink, _second_rx) = sink();

        let Ok(first) = broker.subscribe("site/+/status", QoS::AtLeastOnce, first_sink).await
        else {
            panic!("first subscribe failed");
        };
        let Ok(second) = broker.subscribe("site/+/status", QoS::AtLeastOnce, second_sink).await
        else {
            panic!("second subscribe failed");
        };
        assert_eq!(
            server.next_received().await,
            Received::Subscribe(vec!["site/+/status".to_string()])
        );

        server.push_publish("site/s1/status", b"up");
        let Ok(Some(message)) = tokio::time::timeout(Duration::from_secs(2), first_rx.recv()).await
        else {
            panic!("expected a routed message");
        };
        assert_eq!(message.payload, b"up".to_vec());

        assert!(broker.unsubscribe(&first).await.is_ok());
        settle(&broker).await;
        assert!(server.active_filters().contains("site/+/status"));

        assert!(broker.unsubscribe(&second).await.is_ok());
        settle(&broker).await;
        assert!(server.active_filters().is_empty());
        let received = server.drain_received();
        let count = |wanted: fn(&Received) -> bool| received.iter().filter(|r| wanted(r)).count();
        assert_eq!(count(|r| matches!(r, Received::Subscribe(_))), 0);
        assert_eq!(count(|r| matches!(r, Received::Unsubscribe(_))), 1);
    }

    #[tokio::test]
    async fn refused_suback_fails_subscribe() {
        let server = TestServer::start(ServerOptions {
            refused_filters: vec!["secret/#".to_string()],
            ..ServerOptions::default()
        })
        .await;
        let broker = connected(&server).await;
        let (sink, _rx) = sink();

        let result = broker.subscribe("secret/#", QoS::AtLeastOnce, sink).await;
        let Err(BrokerError::Subscribe { reason, .. }) = &result else {
            panic!("refused filter must fail, got {result:?}");
        };
        assert!(reason.contains("refused"));
        assert_eq!(broker.router.len().await, 0);
    }

    #[tokio::test]
    async fn publish_returns_after_puback() {
        let mut server = TestServer::start(ServerOptions::default()).await;
        let broker = connected(&server).await;

        let published = broker
            .publish("site/s1/node/n1/cmd", QoS::AtLeastOnce, false, b"on".to_vec())
            .await;
        assert!(published.is_ok());
        // the ack implies the server already saw the packet
        assert_eq!(
            server.drain_received(),
            vec![Received::Publish {
                topic: "site/s1/node/n1/cmd".to_string(),
                qos: 1,
                payload: b"on".to_vec(),
            }]
        );

        let exactly_once = broker
            .publish("site/s1/node/n1/cmd", QoS::ExactlyOnce, false, b"off".to_vec())
            .await;
        assert!(exactly_once.is_ok());
        assert!(matches!(
            server.next_received().await,
            Received::Publish { qos: 2, .. }
        ));
    }

    #[tokio::test]
    async fn unacknowledged_publish_times_out() {
        let server = TestServer::start(ServerOptions {
            ack_publishes: false,
            ..ServerOptions::default()
        })
        .await;
        let broker = connect(&server, Duration::from_millis(200));
        for _ in 0..100 {
            if broker.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let result = broker.publish("a/b", QoS::AtLeastOnce, false, Vec::new()).await;
        let Err(BrokerError::Publish { reason, .. }) = &result else {
            panic!("expected a publish timeout, got {result:?}");
        };
        assert!(reason.contains("200ms"));
    }

    #[tokio::test]
    async fn offline_subscribe_is_restored_on_connack() {
        let (release, gate) = tokio::sync::oneshot::channel();
        let mut server = TestServer::start(ServerOptions {
            connack_gate: Some(gate),
            ..ServerOptions::default()
        })
        .await;
        let broker = connect(&server, Duration::from_secs(2));
        let (sink, mut rx) = sink();

        assert!(!broker.is_connected());
        let published = broker.publish("a/b", QoS::AtMostOnce, false, Vec::new()).await;
        assert_eq!(published, Err(BrokerError::NotConnected));
        let Ok(_handle) = broker.subscribe("site/+/mmwave", QoS::AtLeastOnce, sink).await else {
            panic!("offline subscribe must be deferred, not refused");
        };
        assert!(server.drain_received().is_empty());

        let _ = release.send(());
        assert_eq!(
            server.next_received().await,
            Received::Subscribe(vec!["site/+/mmwave".to_string()])
        );
        server.push_publish("site/s1/mmwave", b"{}");
        let Ok(Some(message)) = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await
        else {
            panic!("restored subscription must route messages");
        };
        assert_eq!(message.topic, "site/s1/mmwave");
    }

    #[tokio::test]
    async fn racing_unsubscribe_and_subscribe_keep_filter_alive() {
        let server = TestServer::start(ServerOptions::default()).await;
        let broker = connected(&server).await;
        let (sink_a, _rx_a) = sink();
        let (sink_b, _rx_b) = sink();
        let filter = "site/+/coord/+/telemetry";

        let Ok(mut a) = broker.subscribe(filter, QoS::AtLeastOnce, Arc::clone(&sink_a)).await
        else {
            panic!("subscribe failed");
        };
        for round in 0..20 {
            let (released, b) = tokio::join!(
                broker.unsubscribe(&a),
                broker.subscribe(filter, QoS::AtLeastOnce, Arc::clone(&sink_b))
            );
            assert!(released.is_ok());
            let Ok(b) = b else {
                panic!("subscribe failed in round {round}");
            };
            settle(&broker).await;
            assert!(
                server.active_filters().contains(filter),
                "broker lost the filter in round {round}"
            );

            assert!(broker.unsubscribe(&b).await.is_ok());
            let Ok(next) = broker.subscribe(filter, QoS::AtLeastOnce, Arc::clone(&sink_a)).await
            else {
                panic!("resubscribe failed in round {round}");
            };
            a = next;
        }
    }
}
