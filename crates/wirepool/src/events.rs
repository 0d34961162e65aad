//! Pool lifecycle events.
//!
//! Every interesting transition is published on a broadcast channel so that
//! operators can watch the pool without polling it. Slow receivers lag and
//! lose events; the pool never blocks on them.

use std::fmt;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::connection::ConnectionId;
use crate::host::HostKey;
use crate::queue::{Priority, RequestId};

/// Why a connection left the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// Unused for longer than the idle timeout
    Idle,
    /// Transport failed while nobody was subscribed
    TransportFailure,
    /// Every reconnect attempt failed
    ReconnectExhausted,
    /// The initial handshake failed or timed out
    HandshakeFailed,
    /// The pool was destroyed
    Shutdown,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::TransportFailure => "transport_failure",
            Self::ReconnectExhausted => "reconnect_exhausted",
            Self::HandshakeFailed => "handshake_failed",
            Self::Shutdown => "shutdown",
        })
    }
}

/// Lifecycle event published by the pool
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    /// A connection entry was created and its handshake started
    ConnectionCreated {
        /// Connection id
        connection_id: ConnectionId,
        /// Host bucket
        host: HostKey,
    },
    /// The handshake completed
    ConnectionOpened {
        /// Connection id
        connection_id: ConnectionId,
        /// Host bucket
        host: HostKey,
    },
    /// The handshake failed or timed out
    HandshakeFailed {
        /// Connection id
        connection_id: ConnectionId,
        /// Host bucket
        host: HostKey,
        /// Failure description
        error: String,
    },
    /// A transport error lowered a connection's health
    HealthDegraded {
        /// Connection id
        connection_id: ConnectionId,
        /// Score after the penalty
        health_score: u8,
    },
    /// A reconnect attempt was scheduled
    Reconnecting {
        /// Connection id
        connection_id: ConnectionId,
        /// Attempt number, starting at 1
        attempt: u32,
        /// Backoff before the attempt
        delay_ms: u64,
    },
    /// A reconnect attempt succeeded
    Reconnected {
        /// Connection id
        connection_id: ConnectionId,
        /// Attempts it took
        attempts: u32,
    },
    /// A connection was removed from the pool
    ConnectionRemoved {
        /// Connection id
        connection_id: ConnectionId,
        /// Host bucket
        host: HostKey,
        /// Why it was removed
        reason: RemovalReason,
    },
    /// An acquire had to wait for capacity
    RequestQueued {
        /// Request id
        request_id: RequestId,
        /// Host bucket
        host: HostKey,
        /// Requested priority
        priority: Priority,
        /// Queue length after enqueueing
        queue_depth: usize,
    },
    /// A queued acquire hit its deadline
    RequestTimedOut {
        /// Request id
        request_id: RequestId,
        /// Host bucket
        host: HostKey,
        /// Requested priority
        priority: Priority,
        /// Time spent in the queue
        waited_ms: u64,
    },
}

/// Broadcast publisher for [`PoolEvent`]s
#[derive(Debug, Clone)]
pub struct PoolEventEmitter {
    sender: broadcast::Sender<PoolEvent>,
}

impl PoolEventEmitter {
    /// Create an emitter buffering up to `capacity` events per receiver
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// New receiver that sees events published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no receivers is not an error.
    pub fn emit(&self, event: PoolEvent) {
        let _ = self.sender.send(event);
    }

    /// Number of live receivers
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::parse_target;

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let emitter = PoolEventEmitter::new(8);
        let mut rx = emitter.subscribe();
        assert_eq!(emitter.receiver_count(), 1);

        let host = parse_target("ws://a.example/").unwrap().1;
        emitter.emit(PoolEvent::ConnectionRemoved {
            connection_id: ConnectionId::new(3),
            host,
            reason: RemovalReason::Idle,
        });

        match rx.recv().await.unwrap() {
            PoolEvent::ConnectionRemoved {
                connection_id,
                reason,
                ..
            } => {
                assert_eq!(connection_id, ConnectionId::new(3));
                assert_eq!(reason, RemovalReason::Idle);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_emit_without_receivers() {
        let emitter = PoolEventEmitter::new(0);
        emitter.emit(PoolEvent::Reconnected {
            connection_id: ConnectionId::new(1),
            attempts: 2,
        });
        assert_eq!(emitter.receiver_count(), 0);
    }

    #[test]
    fn test_event_json_shape() {
        let event = PoolEvent::Reconnecting {
            connection_id: ConnectionId::new(4),
            attempt: 1,
            delay_ms: 2000,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "reconnecting");
        assert_eq!(json["connection_id"], 4);
        assert_eq!(json["delay_ms"], 2000);
    }
}
