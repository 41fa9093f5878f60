//! Per-connection session loop.
//!
//! Reads client requests, answers each with exactly one envelope, and tears
//! the connection down (broadcaster first, then broker subscriptions, then
//! the transport) when the peer leaves or a write fails anywhere.

use std::fmt;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{Stream, StreamExt};

use super::broadcaster::ConnectionBroadcaster;
use super::messages::{ClientRequest, RequestKind, ServerMessage};
use super::sink::ConnectionSink;
use super::subscription::TopicSubscriptionManager;
use crate::app_state::AppState;
use crate::broker::BrokerClient;
use crate::error::TransportError;

/// A frame read from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame, decoded the same way as text.
    Binary(Vec<u8>),
    /// The peer asked to close.
    Close,
}

/// Runs a session over an upgraded axum WebSocket.
pub async fn run_connection(socket: WebSocket, state: AppState) {
    let (ws_tx, ws_rx) = socket.split();
    let sink = Arc::new(ConnectionSink::new(ws_tx, state.write_timeout));

    let frames = ws_rx.filter_map(|msg| async move {
        match msg {
            Ok(Message::Text(text)) => Some(Ok(InboundFrame::Text(text.as_str().to_owned()))),
            Ok(Message::Binary(bytes)) => Some(Ok(InboundFrame::Binary(bytes.to_vec()))),
            Ok(Message::Close(_)) => Some(Ok(InboundFrame::Close)),
            // axum answers pings itself
            Ok(Message::Ping(_) | Message::Pong(_)) => None,
            Err(e) => Some(Err(e)),
        }
    });
    let frames = std::pin::pin!(frames);

    run_session(frames, sink, state.broker, &state.broadcaster).await;
}

/// Drives one client session until the peer closes, a read fails, or the
/// connection is closed from elsewhere (failed broadcast or topic write).
///
/// The connection is registered with `broadcaster` for exactly as long as
/// this loop runs.
pub async fn run_session<S, E>(
    mut frames: S,
    sink: Arc<ConnectionSink>,
    broker: Arc<dyn BrokerClient>,
    broadcaster: &ConnectionBroadcaster,
) where
    S: Stream<Item = Result<InboundFrame, E>> + Unpin,
    E: fmt::Display,
{
    let conn_id = sink.id();
    broadcaster.register(Arc::clone(&sink)).await;
    let mut subs = TopicSubscriptionManager::new(broker, Arc::clone(&sink));
    tracing::info!(%conn_id, "connection opened");

    loop {
        tokio::select! {
            frame = frames.next() => {
                let reply = match frame {
                    Some(Ok(InboundFrame::Text(text))) => handle_request(text.as_bytes(), &mut subs).await,
                    Some(Ok(InboundFrame::Binary(bytes))) => handle_request(&bytes, &mut subs).await,
                    Some(Ok(InboundFrame::Close)) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(%conn_id, error = %e, "read failed");
                        break;
                    }
                };
                if let Err(e) = sink.send_json(&reply).await {
                    if e != TransportError::Closed {
                        tracing::debug!(%conn_id, error = %e, "reply write failed");
                    }
                    break;
                }
            }
            () = sink.closed() => break,
        }
    }

    broadcaster.unregister(conn_id).await;
    let released = subs.close_all().await;
    sink.close().await;
    tracing::info!(%conn_id, released, "connection closed");
}

/// Decodes one request and returns the envelope to answer it with.
async fn handle_request(bytes: &[u8], subs: &mut TopicSubscriptionManager) -> ServerMessage {
    let Ok(request) = serde_json::from_slice::<ClientRequest>(bytes) else {
        return ServerMessage::error("invalid json");
    };
    if request.kind == RequestKind::Unknown {
        return ServerMessage::error("unknown type");
    }
    let qos = request.qos();
    let ClientRequest {
        kind,
        topic,
        payload,
        ..
    } = request;
    let topic = topic.unwrap_or_default();
    if topic.is_empty() {
        return ServerMessage::error("missing topic");
    }

    match kind {
        RequestKind::Subscribe => subs.subscribe(&topic).await,
        RequestKind::Unsubscribe => subs.unsubscribe(&topic).await,
        RequestKind::Publish => match qos {
            Some(qos) => subs.publish(&topic, payload, qos).await,
            None => ServerMessage::error("invalid qos"),
        },
        RequestKind::Unknown => ServerMessage::error("unknown type"),
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::broker::loopback::BrokerCall;
    use crate::broker::{LoopbackBroker, QoS};
    use crate::ws::broadcaster::BroadcasterConfig;
    use crate::ws::sink::testing::{channel_sink, next_json};
    use serde_json::json;
    use std::convert::Infallible;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    struct Harness {
        frames: mpsc::UnboundedSender<Result<InboundFrame, Infallible>>,
        replies: mpsc::UnboundedReceiver<String>,
        sink: Arc<ConnectionSink>,
        broker: Arc<LoopbackBroker>,
        broadcaster: ConnectionBroadcaster,
        session: JoinHandle<()>,
    }

    impl Harness {
        fn start() -> Self {
            let broker = Arc::new(LoopbackBroker::recording());
            let broadcaster = ConnectionBroadcaster::spawn(BroadcasterConfig::default());
            let (sink, replies) = channel_sink(Duration::from_secs(1));
            let sink = Arc::new(sink);
            let (frames, rx) = mpsc::unbounded_channel();
            let stream = Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|frame| (frame, rx))
            }));

            let session = {
                let sink = Arc::clone(&sink);
                let broker = Arc::clone(&broker) as Arc<dyn BrokerClient>;
                let broadcaster = broadcaster.clone();
                tokio::spawn(async move { run_session(stream, sink, broker, &broadcaster).await })
            };

            Self {
                frames,
                replies,
                sink,
                broker,
                broadcaster,
                session,
            }
        }

        fn send(&self, text: &str) {
            let _ = self.frames.send(Ok(InboundFrame::Text(text.to_string())));
        }

        async fn request(&mut self, text: &str) -> serde_json::Value {
            self.send(text);
            next_json(&mut self.replies).await
        }

        async fn finish(self) -> Arc<LoopbackBroker> {
            let _ = self.frames.send(Ok(InboundFrame::Close));
            let done = tokio::time::timeout(Duration::from_secs(2), self.session).await;
            assert!(matches!(done, Ok(Ok(()))), "session did not end");
            self.broker
        }
    }

    #[tokio::test]
    async fn subscribe_then_receive_message() {
        let mut h = Harness::start();
        let topic = "site/s1/coord/c1/telemetry";

        let ack = h
            .request(r#"{"type":"subscribe","topic":"site/s1/coord/c1/telemetry"}"#)
            .await;
        assert_eq!(ack, json!({"type": "subscribed", "topic": topic}));

        h.broker.inject(topic, r#"{"lightLux":250,"tempC":21.5}"#).await;
        let msg = next_json(&mut h.replies).await;
        assert_eq!(msg["type"], "message");
        assert_eq!(msg["topic"], topic);
        assert_eq!(msg["payload"], json!({"lightLux": 250, "tempC": 21.5}));
        assert!(msg["timestamp"].is_i64());
        h.finish().await;
    }

    #[tokio::test]
    async fn publish_reaches_broker_as_json() {
        let mut h = Harness::start();
        let ack = h
            .request(r#"{"type":"publish","topic":"site/s1/node/n1/cmd","payload":{"cmd":"off"},"qos":1}"#)
            .await;
        assert_eq!(ack, json!({"type": "published", "topic": "site/s1/node/n1/cmd"}));

        let calls = h.broker.calls().await;
        let Some(BrokerCall::Publish { topic, qos, payload, .. }) = calls.last() else {
            panic!("expected a publish call");
        };
        assert_eq!(topic, "site/s1/node/n1/cmd");
        assert_eq!(*qos, QoS::AtLeastOnce);
        let Ok(decoded) = serde_json::from_slice::<serde_json::Value>(payload) else {
            panic!("payload is json");
        };
        assert_eq!(decoded, json!({"cmd": "off"}));
        h.finish().await;
    }

    #[tokio::test]
    async fn bad_requests_get_errors_and_session_continues() {
        let mut h = Harness::start();
        let cases = [
            ("{not json", "invalid json"),
            (r#"{"type":"ping","topic":"a"}"#, "unknown type"),
            (r#"{"topic":"a"}"#, "unknown type"),
            (r#"{"type":"subscribe"}"#, "missing topic"),
            (r#"{"type":"subscribe","topic":null}"#, "missing topic"),
            (r#"{"type":"unsubscribe","topic":""}"#, "missing topic"),
            (r#"{"type":"publish","topic":"a/b","qos":3}"#, "invalid qos"),
            (r#"{"type":"publish","topic":"a/b","qos":"high"}"#, "invalid qos"),
        ];
        for (request, message) in cases {
            let reply = h.request(request).await;
            assert_eq!(reply, json!({"type": "error", "message": message}), "{request}");
        }

        let ack = h.request(r#"{"type":"unsubscribe","topic":"never"}"#).await;
        assert_eq!(ack, json!({"type": "unsubscribed", "topic": "never"}));
        h.finish().await;
    }

    #[tokio::test]
    async fn string_qos_is_accepted() {
        let mut h = Harness::start();
        let ack = h
            .request(r#"{"type":"publish","topic":"a/b","payload":"on","qos":"2"}"#)
            .await;
        assert_eq!(ack, json!({"type": "published", "topic": "a/b"}));

        let calls = h.broker.calls().await;
        let Some(BrokerCall::Publish { qos, payload, .. }) = calls.last() else {
            panic!("expected a publish call");
        };
        assert_eq!(*qos, QoS::ExactlyOnce);
        assert_eq!(payload, b"on");
        h.finish().await;
    }

    #[tokio::test]
    async fn binary_frames_are_decoded_like_text() {
        let mut h = Harness::start();
        let _ = h.frames.send(Ok(InboundFrame::Binary(
            br#"{"type":"subscribe","topic":"a/b"}"#.to_vec(),
        )));
        let ack = next_json(&mut h.replies).await;
        assert_eq!(ack, json!({"type": "subscribed", "topic": "a/b"}));
        h.finish().await;
    }

    #[tokio::test]
    async fn broadcasts_reach_the_session() {
        let mut h = Harness::start();
        // the first reply proves registration happened
        h.request(r#"{"type":"unsubscribe","topic":"x"}"#).await;
        assert_eq!(h.broadcaster.active_count().await, 1);

        assert!(h.broadcaster.broadcast(&json!({"type": "node_telemetry"})));
        let frame = next_json(&mut h.replies).await;
        assert_eq!(frame, json!({"type": "node_telemetry"}));
        h.finish().await;
    }

    #[tokio::test]
    async fn teardown_releases_everything() {
        let mut h = Harness::start();
        for topic in ["a/1", "a/2", "a/3"] {
            let ack = h
                .request(&format!(r#"{{"type":"subscribe","topic":"{topic}"}}"#))
                .await;
            assert_eq!(ack["type"], "subscribed");
        }
        let sink = Arc::clone(&h.sink);
        let broadcaster = h.broadcaster.clone();

        let broker = h.finish().await;
        let unsubscribes = broker
            .calls()
            .await
            .iter()
            .filter(|c| matches!(c, BrokerCall::Unsubscribe { .. }))
            .count();
        assert_eq!(unsubscribes, 3);
        assert_eq!(broker.subscription_count().await, 0);
        assert_eq!(broadcaster.active_count().await, 0);
        assert!(sink.is_closed());

        // a second close is a no-op
        assert!(!sink.close().await);
        broadcaster.unregister(sink.id()).await;
        assert_eq!(broadcaster.active_count().await, 0);
    }

    #[tokio::test]
    async fn closing_the_sink_elsewhere_ends_the_session() {
        let h = Harness::start();
        h.send(r#"{"type":"subscribe","topic":"a/b"}"#);
        let mut replies = h.replies;
        next_json(&mut replies).await;

        h.sink.close().await;
        let done = tokio::time::timeout(Duration::from_secs(2), h.session).await;
        assert!(matches!(done, Ok(Ok(()))), "session did not end");
        assert_eq!(h.broker.subscription_count().await, 0);
        assert_eq!(h.broadcaster.active_count().await, 0);
    }
}
