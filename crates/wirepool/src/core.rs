//! Core transport traits and types.
//!
//! The pool never speaks a wire protocol itself. It drives sockets through the
//! [`Connector`] and [`Socket`] traits, and consumes inbound traffic as a
//! stream of [`SocketEvent`]s delivered over an unbounded channel.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

/// Result type for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Errors that can occur in transport operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection could not be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Handshake did not complete within the allotted time
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// An established connection was lost
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Send operation failed
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Liveness probe could not be written
    #[error("Ping failed: {0}")]
    PingFailed(String),

    /// Receive operation failed
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// A single application message carried by a socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum Payload {
    /// UTF-8 text frame
    Text(String),
    /// Binary frame
    Binary(Bytes),
}

impl Payload {
    /// Size of the payload in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) => data.len(),
        }
    }

    /// Check if the payload carries no data
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the payload as text, if it is a text frame
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Self::Binary(data)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(data))
    }
}

/// Inbound events produced by an open socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// Application message from the peer
    Message(Payload),
    /// Reply to a liveness probe
    Pong,
    /// The peer or the transport closed the connection
    Closed {
        /// Close reason, when the peer supplied one
        reason: Option<String>,
    },
    /// The transport reported an error
    Error(TransportError),
}

/// Handshake parameters passed to a [`Connector`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenOptions {
    /// Upper bound for the handshake
    pub handshake_timeout: Duration,
    /// Ask the peer for per-message compression
    pub enable_compression: bool,
    /// Wire protocol revision to announce
    pub protocol_version: u8,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            enable_compression: false,
            protocol_version: 13,
        }
    }
}

/// Outbound half of an open connection
#[async_trait]
pub trait Socket: Send + Sync + fmt::Debug {
    /// Write one message. Resolves once the transport has accepted the write.
    async fn send(&self, payload: Payload) -> TransportResult<()>;

    /// Write a liveness probe. The reply arrives as [`SocketEvent::Pong`].
    async fn ping(&self) -> TransportResult<()>;

    /// Close the connection. Closing an already closed socket succeeds.
    async fn close(&self) -> TransportResult<()>;
}

/// Result of a successful handshake
#[derive(Debug)]
pub struct OpenedSocket {
    /// Outbound handle
    pub socket: Arc<dyn Socket>,
    /// Inbound events. The stream ends when the connection is gone.
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Factory that performs the handshake for a URL
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Open a connection to `url`
    async fn open(&self, url: &Url, options: &OpenOptions) -> TransportResult<OpenedSocket>;

    /// Short name used in logs
    fn name(&self) -> &'static str {
        "custom"
    }
}

/// Sending half of a socket's event stream
#[derive(Debug, Clone)]
pub struct SocketEventEmitter {
    sender: mpsc::UnboundedSender<SocketEvent>,
}

impl SocketEventEmitter {
    /// Create an emitter and the receiver that goes into [`OpenedSocket::events`]
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SocketEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Emit an event. Returns `false` once nobody is listening.
    pub fn emit(&self, event: SocketEvent) -> bool {
        self.sender.send(event).is_ok()
    }

    /// Emit an inbound message
    pub fn emit_message(&self, payload: Payload) -> bool {
        self.emit(SocketEvent::Message(payload))
    }

    /// Emit a pong
    pub fn emit_pong(&self) -> bool {
        self.emit(SocketEvent::Pong)
    }

    /// Emit a close notification
    pub fn emit_closed(&self, reason: Option<String>) -> bool {
        self.emit(SocketEvent::Closed { reason })
    }

    /// Emit a transport error
    pub fn emit_error(&self, error: TransportError) -> bool {
        self.emit(SocketEvent::Error(error))
    }

    /// Check whether the receiving side has gone away
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_len() {
        assert_eq!(Payload::from("hello").len(), 5);
        assert_eq!(Payload::from(vec![1u8, 2, 3]).len(), 3);
        assert!(Payload::Binary(Bytes::new()).is_empty());
        assert_eq!(Payload::from("hi").as_text(), Some("hi"));
        assert_eq!(Payload::from(Bytes::from_static(b"hi")).as_text(), None);
    }

    #[test]
    fn test_payload_serializes_with_kind_tag() {
        let json = serde_json::to_value(Payload::from("ping")).unwrap();
        assert_eq!(json["kind"], "text");
        assert_eq!(json["data"], "ping");
    }

    #[tokio::test]
    async fn test_emitter_delivers_in_order() {
        let (emitter, mut events) = SocketEventEmitter::new();
        assert!(emitter.emit_message(Payload::from("a")));
        assert!(emitter.emit_pong());
        assert!(emitter.emit_closed(Some("bye".to_string())));

        assert_eq!(
            events.recv().await,
            Some(SocketEvent::Message(Payload::from("a")))
        );
        assert_eq!(events.recv().await, Some(SocketEvent::Pong));
        assert_eq!(
            events.recv().await,
            Some(SocketEvent::Closed {
                reason: Some("bye".to_string())
            })
        );
    }

    #[test]
    fn test_emitter_reports_dropped_receiver() {
        let (emitter, events) = SocketEventEmitter::new();
        drop(events);
        assert!(emitter.is_closed());
        assert!(!emitter.emit_pong());
    }

    #[test]
    fn test_io_error_conversion() {
        let err: TransportError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed").into();
        assert!(matches!(err, TransportError::Io(msg) if msg.contains("pipe closed")));
    }
}
