//! Fleet-wide fan-out to every registered connection.
//!
//! [`ConnectionBroadcaster`] is a cheap, cloneable handle onto a single
//! coordination task ([`BroadcastLoop`]). That task is the only owner of the
//! active-connection set: registrations, unregistrations and deliveries are
//! all messages on its queues, so the set is never mutated while it is being
//! iterated.
//!
//! Each registered connection gets a delivery worker with its own bounded
//! frame queue. The coordination loop only ever `try_send`s into those
//! queues, so one slow or dead client cannot stall the others. A worker that
//! misses its write deadline, fails a write, or lets its queue fill up gets
//! its connection unregistered through the same command queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use super::sink::ConnectionSink;
use crate::domain::ConnectionId;
use crate::error::TransportError;

/// Queue sizes for the broadcaster.
#[derive(Debug, Clone, Copy)]
pub struct BroadcasterConfig {
    /// Submission queue capacity. Broadcasts beyond it are dropped.
    pub queue_capacity: usize,
    /// Frames that may wait for one connection before it counts as stalled.
    pub connection_queue_capacity: usize,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            connection_queue_capacity: 64,
        }
    }
}

enum Command {
    Register {
        sink: Arc<ConnectionSink>,
        ack: oneshot::Sender<()>,
    },
    Unregister {
        id: ConnectionId,
        ack: Option<oneshot::Sender<()>>,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
}

/// Handle used to register connections and broadcast to them.
#[derive(Debug, Clone)]
pub struct ConnectionBroadcaster {
    commands: mpsc::Sender<Command>,
    frames: mpsc::Sender<Arc<str>>,
    dropped: Arc<AtomicU64>,
}

impl ConnectionBroadcaster {
    /// Creates a broadcaster handle and the coordination loop that serves it.
    ///
    /// Nothing is delivered until [`BroadcastLoop::run`] is polled; most
    /// callers want [`spawn`](Self::spawn).
    #[must_use]
    pub fn new(config: BroadcasterConfig) -> (Self, BroadcastLoop) {
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (frames_tx, frames_rx) = mpsc::channel(config.queue_capacity.max(1));
        let handle = Self {
            commands: commands_tx.clone(),
            frames: frames_tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        let run_loop = BroadcastLoop {
            commands_rx,
            frames_rx,
            commands_tx: commands_tx.downgrade(),
            active: HashMap::new(),
            connection_queue_capacity: config.connection_queue_capacity.max(1),
        };
        (handle, run_loop)
    }

    /// Creates a broadcaster and spawns its coordination loop.
    #[must_use]
    pub fn spawn(config: BroadcasterConfig) -> Self {
        let (handle, run_loop) = Self::new(config);
        tokio::spawn(run_loop.run());
        handle
    }

    /// Adds a connection to the active set. Returns once the coordination
    /// loop has acknowledged it, after which it receives every broadcast.
    /// Registering an already registered connection is a no-op.
    pub async fn register(&self, sink: Arc<ConnectionSink>) {
        let id = sink.id();
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Register { sink, ack }).await.is_err() {
            tracing::warn!(conn_id = %id, "broadcaster stopped, connection not registered");
            return;
        }
        let _ = done.await;
    }

    /// Removes a connection from the active set and closes it if it is
    /// still open. Unknown or already removed connections are ignored.
    pub async fn unregister(&self, id: ConnectionId) {
        let (ack, done) = oneshot::channel();
        let command = Command::Unregister { id, ack: Some(ack) };
        if self.commands.send(command).await.is_err() {
            return;
        }
        let _ = done.await;
    }

    /// Queues `value` for delivery to every connection registered when the
    /// coordination loop gets to it.
    ///
    /// Never waits: if the submission queue is full the value is dropped,
    /// the drop counter is incremented and `false` is returned.
    pub fn broadcast<T: Serialize + ?Sized>(&self, value: &T) -> bool {
        let frame: Arc<str> = match serde_json::to_string(value) {
            Ok(json) => Arc::from(json),
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize broadcast");
                return false;
            }
        };
        match self.frames.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed).saturating_add(1);
                tracing::warn!(dropped, "broadcast queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("broadcaster stopped, dropping message");
                false
            }
        }
    }

    /// Returns the number of registered connections as seen by the
    /// coordination loop.
    pub async fn active_count(&self) -> usize {
        let (reply, count) = oneshot::channel();
        if self.commands.send(Command::Count { reply }).await.is_err() {
            return 0;
        }
        count.await.unwrap_or(0)
    }

    /// Returns how many broadcasts were dropped because the submission
    /// queue was full.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct Member {
    sink: Arc<ConnectionSink>,
    queue: mpsc::Sender<Arc<str>>,
}

/// Coordination loop owning the active-connection set.
///
/// Runs until every [`ConnectionBroadcaster`] handle has been dropped.
pub struct BroadcastLoop {
    commands_rx: mpsc::Receiver<Command>,
    frames_rx: mpsc::Receiver<Arc<str>>,
    commands_tx: mpsc::WeakSender<Command>,
    active: HashMap<ConnectionId, Member>,
    connection_queue_capacity: usize,
}

impl std::fmt::Debug for BroadcastLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastLoop")
            .field("active", &self.active.len())
            .field("connection_queue_capacity", &self.connection_queue_capacity)
            .finish_non_exhaustive()
    }
}

impl BroadcastLoop {
    /// Serves commands and broadcasts until all handles are gone.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                command = self.commands_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                frame = self.frames_rx.recv() => match frame {
                    Some(frame) => self.fan_out(&frame),
                    None => break,
                },
            }
        }

        for (_, member) in self.active.drain() {
            spawn_close(member.sink);
        }
        tracing::debug!("broadcaster stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Register { sink, ack } => {
                let id = sink.id();
                if !self.active.contains_key(&id) {
                    let (queue, rx) = mpsc::channel(self.connection_queue_capacity);
                    tokio::spawn(deliver(Arc::clone(&sink), rx, self.commands_tx.clone()));
                    self.active.insert(id, Member { sink, queue });
                    tracing::info!(conn_id = %id, active = self.active.len(), "client registered");
                }
                let _ = ack.send(());
            }
            Command::Unregister { id, ack } => {
                self.remove(id);
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            Command::Count { reply } => {
                let _ = reply.send(self.active.len());
            }
        }
    }

    fn fan_out(&mut self, frame: &Arc<str>) {
        let mut stalled = Vec::new();
        for (id, member) in &self.active {
            match member.queue.try_send(Arc::clone(frame)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(conn_id = %id, "client backlog full, unregistering");
                    stalled.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => stalled.push(*id),
            }
        }
        tracing::trace!(recipients = self.active.len(), "broadcast delivered to queues");
        for id in stalled {
            self.remove(id);
        }
    }

    fn remove(&mut self, id: ConnectionId) {
        if let Some(member) = self.active.remove(&id) {
            tracing::info!(conn_id = %id, active = self.active.len(), "client unregistered");
            spawn_close(member.sink);
        }
    }
}

/// Closes a connection off the coordination task; closing waits for the
/// writer lock and may take up to the write deadline.
fn spawn_close(sink: Arc<ConnectionSink>) {
    tokio::spawn(async move {
        sink.close().await;
    });
}

/// Per-connection delivery worker. Writes frames in order and reports the
/// connection for unregistration on the first failed write.
async fn deliver(
    sink: Arc<ConnectionSink>,
    mut frames: mpsc::Receiver<Arc<str>>,
    commands: mpsc::WeakSender<Command>,
) {
    while let Some(frame) = frames.recv().await {
        match sink.send_text(frame.to_string()).await {
            Ok(()) => {}
            Err(TransportError::Closed) => break,
            Err(e) => {
                tracing::warn!(conn_id = %sink.id(), error = %e, "broadcast write failed");
                if let Some(commands) = commands.upgrade() {
                    let command = Command::Unregister {
                        id: sink.id(),
                        ack: None,
                    };
                    let _ = commands.send(command).await;
                }
                break;
            }
        }
    }
}
