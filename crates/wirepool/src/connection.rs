//! Pooled connection records and the handles given to callers.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;
use uuid::Uuid;

use crate::core::{Payload, Socket, TransportError};
use crate::events::RemovalReason;
use crate::host::HostKey;
use crate::robustness::HealthScore;

/// Identifier of a pooled connection. Stable across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a raw id
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Identifier of a caller holding or observing a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    /// Generate a random subscriber id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SubscriberId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Lifecycle state of a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Handshake in progress
    Connecting,
    /// Handshake completed, not yet assigned
    Connected,
    /// Open with no subscribers
    Idle,
    /// Open with at least one subscriber
    Busy,
    /// Waiting for or performing a reconnect
    Reconnecting,
    /// Terminal; the entry is about to be removed
    Failed,
}

impl ConnectionState {
    /// A socket is installed and usable
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Connected | Self::Idle | Self::Busy)
    }

    /// Can be handed to a new acquirer
    #[must_use]
    pub const fn is_reusable(self) -> bool {
        matches!(self, Self::Connected | Self::Idle)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        })
    }
}

/// Returned by a successful acquire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    connection_id: ConnectionId,
    subscriber_id: SubscriberId,
    url: Url,
    host: HostKey,
}

impl ConnectionHandle {
    /// Connection the caller was attached to
    #[must_use]
    pub const fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Subscriber id to pass back to `release`
    #[must_use]
    pub const fn subscriber_id(&self) -> SubscriberId {
        self.subscriber_id
    }

    /// Target URL of the connection
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// Host bucket of the connection
    #[must_use]
    pub const fn host(&self) -> &HostKey {
        &self.host
    }
}

/// Result of a successful send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SendReceipt {
    /// Connection the message went out on
    pub connection_id: ConnectionId,
    /// Payload size in bytes
    pub bytes: usize,
    /// Time from submission until the transport accepted the write
    #[serde(serialize_with = "serialize_duration_ms")]
    pub latency: Duration,
}

fn serialize_duration_ms<S: serde::Serializer>(
    duration: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
}

/// Event delivered to a [`Subscription`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Inbound application message
    Message(Payload),
    /// The transport reported an error; the pool is handling it
    Error(TransportError),
    /// The connection was restored under the same id
    Reconnected {
        /// Attempts it took
        attempts: u32,
    },
    /// The connection left the pool. No further events follow.
    Closed {
        /// Why it was removed
        reason: RemovalReason,
    },
}

/// Stream of [`ConnectionEvent`]s for one observer of one connection
#[derive(Debug)]
pub struct Subscription {
    connection_id: ConnectionId,
    subscriber_id: SubscriberId,
    receiver: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl Subscription {
    pub(crate) fn new(
        connection_id: ConnectionId,
        subscriber_id: SubscriberId,
        receiver: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> Self {
        Self {
            connection_id,
            subscriber_id,
            receiver,
        }
    }

    /// Connection being observed
    #[must_use]
    pub const fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Observer this subscription belongs to
    #[must_use]
    pub const fn subscriber_id(&self) -> SubscriberId {
        self.subscriber_id
    }

    /// Wait for the next event. `None` once the connection is gone or the
    /// observer was unsubscribed.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.receiver.recv().await
    }

    /// Take an already delivered event without waiting
    pub fn try_recv(&mut self) -> Option<ConnectionEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = ConnectionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Point-in-time view of one connection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    /// Connection id
    pub id: ConnectionId,
    /// Target URL
    pub url: String,
    /// Host bucket
    pub host: HostKey,
    /// Lifecycle state
    pub state: ConnectionState,
    /// Health score, `0..=100`
    pub health_score: u8,
    /// Attached subscribers
    pub subscribers: usize,
    /// Registered observers
    pub observers: usize,
    /// Messages sent
    pub message_count: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Latency of the most recent send
    pub last_latency_ms: Option<f64>,
    /// Consecutive reconnect attempts
    pub reconnect_attempts: u32,
    /// Wall-clock creation time
    pub created_at: DateTime<Utc>,
    /// Time since the last attach or release
    pub idle_for_ms: u64,
}

/// A pool entry. Only ever touched with the pool state lock held.
#[derive(Debug)]
pub(crate) struct PooledConnection {
    id: ConnectionId,
    url: Url,
    host: HostKey,
    state: ConnectionState,
    socket: Option<Arc<dyn Socket>>,
    reader: Option<JoinHandle<()>>,
    generation: u64,
    subscribers: HashSet<SubscriberId>,
    observers: HashMap<SubscriberId, mpsc::UnboundedSender<ConnectionEvent>>,
    health: HealthScore,
    reconnect_attempts: u32,
    message_count: u64,
    bytes_sent: u64,
    bytes_received: u64,
    last_latency_ms: Option<f64>,
    created_at: DateTime<Utc>,
    last_used: Instant,
}

impl PooledConnection {
    pub(crate) fn new(id: ConnectionId, url: Url, host: HostKey) -> Self {
        Self {
            id,
            url,
            host,
            state: ConnectionState::Connecting,
            socket: None,
            reader: None,
            generation: 0,
            subscribers: HashSet::new(),
            observers: HashMap::new(),
            health: HealthScore::default(),
            reconnect_attempts: 0,
            message_count: 0,
            bytes_sent: 0,
            bytes_received: 0,
            last_latency_ms: None,
            created_at: Utc::now(),
            last_used: Instant::now(),
        }
    }

    pub(crate) const fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) const fn url(&self) -> &Url {
        &self.url
    }

    pub(crate) const fn host(&self) -> &HostKey {
        &self.host
    }

    pub(crate) const fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) const fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) const fn health(&self) -> HealthScore {
        self.health
    }

    pub(crate) const fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub(crate) fn has_subscribers(&self) -> bool {
        !self.subscribers.is_empty()
    }

    pub(crate) fn socket(&self) -> Option<Arc<dyn Socket>> {
        self.socket.clone()
    }

    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used)
    }

    pub(crate) fn handle_for(&self, subscriber_id: SubscriberId) -> ConnectionHandle {
        ConnectionHandle {
            connection_id: self.id,
            subscriber_id,
            url: self.url.clone(),
            host: self.host.clone(),
        }
    }

    /// Add a subscriber. An open connection becomes busy.
    pub(crate) fn attach(&mut self, subscriber: SubscriberId) {
        self.subscribers.insert(subscriber);
        if self.state.is_open() {
            self.state = ConnectionState::Busy;
        }
        self.last_used = Instant::now();
    }

    /// Remove a subscriber and its observer. Returns whether it was attached
    /// and whether the connection went idle as a result.
    pub(crate) fn detach(&mut self, subscriber: SubscriberId) -> (bool, bool) {
        let was_attached = self.subscribers.remove(&subscriber);
        self.observers.remove(&subscriber);
        let mut went_idle = false;
        if self.subscribers.is_empty() && self.state == ConnectionState::Busy {
            self.state = ConnectionState::Idle;
            self.last_used = Instant::now();
            went_idle = true;
        }
        (was_attached, went_idle)
    }

    /// Install a freshly opened socket and return its generation
    pub(crate) fn install_socket(&mut self, socket: Arc<dyn Socket>) -> u64 {
        self.generation += 1;
        self.socket = Some(socket);
        self.state = ConnectionState::Connected;
        self.reconnect_attempts = 0;
        self.generation
    }

    pub(crate) fn set_reader(&mut self, reader: JoinHandle<()>) {
        self.reader = Some(reader);
    }

    /// Move a connected entry to busy or idle depending on its subscribers
    pub(crate) fn settle(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        if self.subscribers.is_empty() {
            self.state = ConnectionState::Idle;
            self.last_used = Instant::now();
        } else {
            self.state = ConnectionState::Busy;
        }
    }

    /// Detach the current socket. Events from its reader become stale.
    pub(crate) fn take_socket(&mut self) -> Option<Arc<dyn Socket>> {
        self.generation += 1;
        self.reader = None;
        self.socket.take()
    }

    /// Enter `Reconnecting`, returning the attempt number and its ticket
    pub(crate) fn begin_reconnect(&mut self) -> (u32, u64) {
        self.reconnect_attempts += 1;
        self.generation += 1;
        self.state = ConnectionState::Reconnecting;
        (self.reconnect_attempts, self.generation)
    }

    pub(crate) fn mark_failed(&mut self) {
        self.state = ConnectionState::Failed;
    }

    pub(crate) fn reward(&mut self) -> u8 {
        self.health.reward()
    }

    pub(crate) fn penalize(&mut self) -> u8 {
        self.health.penalize()
    }

    pub(crate) fn record_send(&mut self, bytes: usize, latency: Duration) {
        self.message_count += 1;
        self.bytes_sent += bytes as u64;
        self.last_latency_ms = Some(latency.as_secs_f64() * 1000.0);
    }

    pub(crate) fn record_receive(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
    }

    /// Register an observer, replacing any previous one with the same id
    pub(crate) fn add_observer(
        &mut self,
        subscriber: SubscriberId,
        sender: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        self.observers.insert(subscriber, sender);
    }

    pub(crate) fn remove_observer(&mut self, subscriber: SubscriberId) -> bool {
        self.observers.remove(&subscriber).is_some()
    }

    /// Fan an event out to every observer, forgetting the ones that hung up
    pub(crate) fn notify(&mut self, event: &ConnectionEvent) {
        self.observers
            .retain(|_, sender| sender.send(event.clone()).is_ok());
    }

    /// Send the final `Closed` event and drop every observer
    pub(crate) fn close_observers(&mut self, reason: RemovalReason) {
        self.notify(&ConnectionEvent::Closed { reason });
        self.observers.clear();
    }

    pub(crate) fn info(&self, now: Instant) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            url: self.url.to_string(),
            host: self.host.clone(),
            state: self.state,
            health_score: self.health.value(),
            subscribers: self.subscribers.len(),
            observers: self.observers.len(),
            message_count: self.message_count,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            last_latency_ms: self.last_latency_ms,
            reconnect_attempts: self.reconnect_attempts,
            created_at: self.created_at,
            idle_for_ms: self.idle_for(now).as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::parse_target;
    use pretty_assertions::assert_eq;

    fn entry() -> PooledConnection {
        let (url, host) = parse_target("ws://a.example/feed").unwrap();
        PooledConnection::new(ConnectionId::new(1), url, host)
    }

    #[test]
    fn test_state_predicates() {
        assert!(ConnectionState::Idle.is_open());
        assert!(ConnectionState::Busy.is_open());
        assert!(!ConnectionState::Reconnecting.is_open());
        assert!(ConnectionState::Connected.is_reusable());
        assert!(!ConnectionState::Busy.is_reusable());
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
    }

    #[tokio::test]
    async fn test_attach_detach_transitions() {
        let mut conn = entry();
        let a = SubscriberId::new();
        let b = SubscriberId::new();

        // still connecting: attach does not make it busy
        conn.attach(a);
        assert_eq!(conn.state(), ConnectionState::Connecting);

        conn.state = ConnectionState::Idle;
        conn.attach(b);
        assert_eq!(conn.state(), ConnectionState::Busy);

        assert_eq!(conn.detach(a), (true, false));
        assert_eq!(conn.state(), ConnectionState::Busy);
        assert_eq!(conn.detach(b), (true, true));
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert_eq!(conn.detach(b), (false, false));
    }

    #[tokio::test]
    async fn test_observers_get_single_close() {
        let mut conn = entry();
        let subscriber = SubscriberId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        conn.add_observer(subscriber, tx);
        let mut subscription = Subscription::new(conn.id(), subscriber, rx);

        conn.notify(&ConnectionEvent::Message(Payload::from("hi")));
        conn.close_observers(RemovalReason::Idle);
        conn.close_observers(RemovalReason::Shutdown);

        assert_eq!(
            subscription.recv().await,
            Some(ConnectionEvent::Message(Payload::from("hi")))
        );
        assert_eq!(
            subscription.recv().await,
            Some(ConnectionEvent::Closed {
                reason: RemovalReason::Idle
            })
        );
        assert_eq!(subscription.recv().await, None);
    }

    #[tokio::test]
    async fn test_info_snapshot() {
        let mut conn = entry();
        conn.record_send(12, Duration::from_millis(5));
        conn.record_receive(30);
        conn.penalize();

        let info = conn.info(Instant::now());
        assert_eq!(info.url, "ws://a.example/feed");
        assert_eq!(info.host.as_str(), "ws://a.example");
        assert_eq!(info.state, ConnectionState::Connecting);
        assert_eq!(info.health_score, 90);
        assert_eq!(info.message_count, 1);
        assert_eq!(info.bytes_sent, 12);
        assert_eq!(info.bytes_received, 30);
        assert_eq!(info.last_latency_ms, Some(5.0));
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::new(42).to_string(), "conn-42");
        assert_eq!(ConnectionId::new(42).as_u64(), 42);
    }
}
