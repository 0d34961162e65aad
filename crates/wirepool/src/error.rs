//! Pool error types.

use std::time::Duration;

use thiserror::Error;

use crate::connection::ConnectionId;
use crate::core::TransportError;

/// Result type for pool operations
pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// Errors surfaced by [`ConnectionPool`](crate::ConnectionPool) operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The handshake did not complete within `connection_timeout`
    #[error("Handshake with {url} timed out after {timeout:?}")]
    HandshakeTimeout {
        /// Target URL
        url: String,
        /// Limit that was exceeded
        timeout: Duration,
    },

    /// The connector rejected the handshake
    #[error("Handshake with {url} failed: {source}")]
    HandshakeFailed {
        /// Target URL
        url: String,
        /// Underlying transport error
        #[source]
        source: TransportError,
    },

    /// A transport operation on an established connection failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A queued acquire was not serviced before its deadline
    #[error("Acquire request for {url} timed out after {waited:?}")]
    RequestTimeout {
        /// Target URL
        url: String,
        /// Time spent waiting in the queue
        waited: Duration,
    },

    /// The pending request queue is full
    #[error("Pool exhausted: {0}")]
    PoolExhausted(String),

    /// The connection exists but is not in a state that accepts sends
    #[error("Connection {0} is not connected")]
    NotConnected(ConnectionId),

    /// No connection with this id is pooled
    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// The URL could not be parsed or has no host
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl {
        /// Offending input
        url: String,
        /// Parser message
        reason: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The pool has been destroyed
    #[error("Connection pool has been shut down")]
    Shutdown,
}

impl PoolError {
    /// Whether the error came from a deadline rather than a transport fault
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::HandshakeTimeout { .. } | Self::RequestTimeout { .. }
        )
    }

    /// Whether retrying the same call later could succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::HandshakeTimeout { .. }
                | Self::HandshakeFailed { .. }
                | Self::Transport(_)
                | Self::RequestTimeout { .. }
                | Self::PoolExhausted(_)
                | Self::NotConnected(_)
        )
    }
}

impl From<::config::ConfigError> for PoolError {
    fn from(err: ::config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}
