//! Write half of a client connection.
//!
//! [`ConnectionSink`] serializes every write to one client behind a single
//! async mutex, whether the frame comes from broadcast fan-out or from a
//! topic subscription, and bounds each write by the connection's write
//! deadline. Closing is idempotent and observable through
//! [`ConnectionSink::closed`], which is how a failed write anywhere ends the
//! connection's receive loop.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::SinkExt;
use futures_util::stream::SplitSink;
use serde::Serialize;
use tokio::sync::{Mutex, watch};

use crate::domain::ConnectionId;
use crate::error::TransportError;

/// Text-frame writer for one duplex channel.
#[async_trait]
pub trait FrameWriter: Send {
    /// Writes one text frame.
    async fn write_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Sends a close frame and releases the channel.
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
impl FrameWriter for SplitSink<WebSocket, Message> {
    async fn write_text(&mut self, text: String) -> Result<(), TransportError> {
        self.send(Message::text(text))
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let _ = self.send(Message::Close(None)).await;
        SinkExt::close(self)
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }
}

/// Serialized, deadline-bounded writer shared by everything that talks to
/// one client.
pub struct ConnectionSink {
    id: ConnectionId,
    writer: Mutex<Box<dyn FrameWriter>>,
    write_timeout: Duration,
    closed: watch::Sender<bool>,
}

impl ConnectionSink {
    /// Wraps `writer` with a fresh [`ConnectionId`].
    #[must_use]
    pub fn new(writer: impl FrameWriter + 'static, write_timeout: Duration) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id: ConnectionId::new(),
            writer: Mutex::new(Box::new(writer)),
            write_timeout,
            closed,
        }
    }

    /// Returns the connection identity.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Writes a text frame.
    ///
    /// Waiting for the writer lock counts against the write deadline.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] after close,
    /// [`TransportError::Timeout`] when the deadline passes, or the
    /// writer's own error.
    pub async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let write = async {
            let mut writer = self.writer.lock().await;
            writer.write_text(text).await
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(
                u64::try_from(self.write_timeout.as_millis()).unwrap_or(u64::MAX),
            )),
        }
    }

    /// Serializes `value` to JSON and writes it as a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Serialize`] if `value` cannot be encoded,
    /// otherwise the same errors as [`send_text`](Self::send_text).
    pub async fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), TransportError> {
        let text =
            serde_json::to_string(value).map_err(|e| TransportError::Serialize(e.to_string()))?;
        self.send_text(text).await
    }

    /// Closes the connection. Only the first call touches the writer; it
    /// returns `true`, later calls return `false`.
    pub async fn close(&self) -> bool {
        if self.closed.send_replace(true) {
            return false;
        }
        let close = async {
            let mut writer = self.writer.lock().await;
            writer.close().await
        };
        match tokio::time::timeout(self.write_timeout, close).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(conn_id = %self.id, error = %e, "close frame not sent"),
            Err(_) => tracing::debug!(conn_id = %self.id, "close timed out"),
        }
        true
    }
}

impl fmt::Debug for ConnectionSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSink")
            .field("id", &self.id)
            .field("write_timeout", &self.write_timeout)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
