//! Just enough of an MQTT 3.1.1 broker to exercise [`super::MqttBroker`].
//!
//! Serves one client connection: answers CONNECT, SUBSCRIBE, UNSUBSCRIBE,
//! PUBLISH (all QoS levels) and PINGREQ, records what the client sent and
//! tracks which filters are currently subscribed.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{mpsc, oneshot};

/// A request the client sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Received {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Publish {
        topic: String,
        qos: u8,
        payload: Vec<u8>,
    },
}

pub(super) struct ServerOptions {
    /// Filters answered with SUBACK failure (0x80).
    pub(super) refused_filters: Vec<String>,
    /// Whether QoS 1/2 publishes are acknowledged.
    pub(super) ack_publishes: bool,
    /// CONNACK is held back until this fires.
    pub(super) connack_gate: Option<oneshot::Receiver<()>>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            refused_filters: Vec::new(),
            ack_publishes: true,
            connack_gate: None,
        }
    }
}

pub(super) struct TestServer {
    pub(super) addr: SocketAddr,
    received: mpsc::UnboundedReceiver<Received>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    active: Arc<Mutex<HashSet<String>>>,
}

impl TestServer {
    pub(super) async fn start(options: ServerOptions) -> Self {
        let Ok(listener) = TcpListener::bind("127.0.0.1:0").await else {
            panic!("bind failed");
        };
        let Ok(addr) = listener.local_addr() else {
            panic!("no local addr");
        };
        let (received_tx, received) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let active = Arc::new(Mutex::new(HashSet::new()));

        let state = Session {
            received: received_tx,
            replies: outbound.clone(),
            active: Arc::clone(&active),
            options,
        };
        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let (reader, mut writer) = stream.into_split();
            let mut outbound_rx = outbound_rx;
            tokio::spawn(async move {
                while let Some(bytes) = outbound_rx.recv().await {
                    if writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
            });
            state.serve(reader).await;
        });

        Self {
            addr,
            received,
            outbound,
            active,
        }
    }

    /// Returns the next recorded request.
    pub(super) async fn next_received(&mut self) -> Received {
        let Ok(Some(received)) =
            tokio::time::timeout(Duration::from_secs(2), self.received.recv()).await
        else {
            panic!("client sent nothing");
        };
        received
    }

    /// Returns every request recorded so far.
    pub(super) fn drain_received(&mut self) -> Vec<Received> {
        let mut all = Vec::new();
        while let Ok(received) = self.received.try_recv() {
            all.push(received);
        }
        all
    }

    pub(super) fn active_filters(&self) -> HashSet<String> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sends a QoS 0 PUBLISH to the client.
    pub(super) fn push_publish(&self, topic: &str, payload: &[u8]) {
        let mut body = encode_str(topic);
        body.extend_from_slice(payload);
        let _ = self.outbound.send(packet(0x30, &body));
    }
}

struct Session {
    received: mpsc::UnboundedSender<Received>,
    replies: mpsc::UnboundedSender<Vec<u8>>,
    active: Arc<Mutex<HashSet<String>>>,
    options: ServerOptions,
}

impl Session {
    async fn serve(mut self, mut reader: OwnedReadHalf) {
        while let Some((header, bytes)) = read_packet(&mut reader).await {
            let mut body = Body(&bytes);
            match header >> 4 {
                1 => {
                    if let Some(gate) = self.options.connack_gate.take() {
                        let _ = gate.await;
                    }
                    self.reply(vec![0x20, 0x02, 0x00, 0x00]);
                }
                3 => {
                    let qos = (header >> 1) & 0x03;
                    let Some(topic) = body.string() else { return };
                    let pkid = if qos > 0 { body.u16() } else { None };
                    let _ = self.received.send(Received::Publish {
                        topic,
                        qos,
                        payload: body.0.to_vec(),
                    });
                    match (pkid, qos) {
                        (Some(pkid), 1) if self.options.ack_publishes => {
                            self.reply(ack(0x40, pkid));
                        }
                        (Some(pkid), 2) if self.options.ack_publishes => {
                            self.reply(ack(0x50, pkid));
                        }
                        _ => {}
                    }
                }
                // PUBREL
                6 => {
                    let Some(pkid) = body.u16() else { return };
                    self.reply(ack(0x70, pkid));
                }
                8 => {
                    let Some(pkid) = body.u16() else { return };
                    let mut filters = Vec::new();
                    let mut codes = Vec::new();
                    while let (Some(filter), Some(qos)) = (body.string(), body.u8()) {
                        if self.options.refused_filters.contains(&filter) {
                            codes.push(0x80);
                        } else {
                            self.active_set().insert(filter.clone());
                            codes.push(qos);
                        }
                        filters.push(filter);
                    }
                    let _ = self.received.send(Received::Subscribe(filters));
                    let mut suback = pkid.to_be_bytes().to_vec();
                    suback.extend(codes);
                    self.reply(packet(0x90, &suback));
                }
                10 => {
                    let Some(pkid) = body.u16() else { return };
                    let mut filters = Vec::new();
                    while let Some(filter) = body.string() {
                        self.active_set().remove(&filter);
                        filters.push(filter);
                    }
                    let _ = self.received.send(Received::Unsubscribe(filters));
                    self.reply(ack(0xB0, pkid));
                }
                12 => self.reply(vec![0xD0, 0x00]),
                14 => return,
                _ => {}
            }
        }
    }

    fn reply(&self, bytes: Vec<u8>) {
        let _ = self.replies.send(bytes);
    }

    fn active_set(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Body<'a>(&'a [u8]);

impl Body<'_> {
    fn u8(&mut self) -> Option<u8> {
        let (first, rest) = self.0.split_first()?;
        self.0 = rest;
        Some(*first)
    }

    fn u16(&mut self) -> Option<u16> {
        let (head, rest) = self.0.split_first_chunk::<2>()?;
        self.0 = rest;
        Some(u16::from_be_bytes(*head))
    }

    fn string(&mut self) -> Option<String> {
        let len = usize::from(self.u16()?);
        let text = self.0.get(..len)?;
        self.0 = self.0.get(len..)?;
        String::from_utf8(text.to_vec()).ok()
    }
}

async fn read_packet(reader: &mut OwnedReadHalf) -> Option<(u8, Vec<u8>)> {
    let header = reader.read_u8().await.ok()?;
    let mut len = 0usize;
    let mut shift = 0;
    loop {
        let byte = reader.read_u8().await.ok()?;
        len |= usize::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0; len];
    reader.read_exact(&mut body).await.ok()?;
    Some((header, body))
}

fn packet(header: u8, body: &[u8]) -> Vec<u8> {
    let mut bytes = vec![header];
    let mut len = body.len();
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        bytes.push(byte);
        if len == 0 {
            break;
        }
    }
    bytes.extend_from_slice(body);
    bytes
}

fn ack(header: u8, pkid: u16) -> Vec<u8> {
    packet(header, &pkid.to_be_bytes())
}

fn encode_str(text: &str) -> Vec<u8> {
    let len = u16::try_from(text.len()).unwrap_or(u16::MAX);
    let mut bytes = len.to_be_bytes().to_vec();
    bytes.extend_from_slice(text.as_bytes());
    bytes
}
