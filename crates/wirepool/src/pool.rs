//! Connection pool orchestrator.
//!
//! All bookkeeping lives in one [`PoolState`] behind a single mutex. The
//! connection table, host index and pending queue are only changed together
//! while that lock is held, and the lock is never held across an await.
//! Handshakes, reconnects, reader loops and maintenance run as tokio tasks
//! that re-enter the pool through the same lock.

mod admission;
mod lifecycle;
mod maintenance;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::connection::{
    ConnectionHandle, ConnectionId, ConnectionInfo, ConnectionState, PooledConnection,
    SendReceipt, SubscriberId, Subscription,
};
use crate::core::{Connector, Payload};
use crate::error::{PoolError, PoolResult};
use crate::events::{PoolEvent, PoolEventEmitter, RemovalReason};
use crate::host::HostIndex;
use crate::metrics::{MetricsCollector, PoolMetrics, TableCounts};
use crate::queue::{PendingQueue, Priority};
use crate::robustness::ReconnectPolicy;

use lifecycle::Failure;

/// Per-host view of the pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    /// Connections per host
    pub hosts: BTreeMap<String, usize>,
    /// Entries in the table
    pub total_connections: usize,
    /// Acquires waiting for capacity
    pub queue_depth: usize,
    /// Whether the pool has been destroyed
    pub closed: bool,
    /// Active configuration
    pub config: PoolConfig,
}

/// Everything guarded by the pool lock
#[derive(Debug)]
pub(crate) struct PoolState {
    connections: HashMap<ConnectionId, PooledConnection>,
    hosts: HostIndex,
    queue: PendingQueue,
    next_connection_id: u64,
    closed: bool,
}

impl PoolState {
    fn new(config: &PoolConfig) -> Self {
        Self {
            connections: HashMap::new(),
            hosts: HostIndex::default(),
            queue: PendingQueue::new(config.max_pending_requests),
            next_connection_id: 0,
            closed: false,
        }
    }

    fn table_counts(&self) -> TableCounts {
        TableCounts::tally(self.connections.values().map(PooledConnection::state))
    }
}

/// Shared core of a [`ConnectionPool`]
#[derive(Debug)]
pub(crate) struct PoolInner {
    config: PoolConfig,
    policy: ReconnectPolicy,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    metrics: MetricsCollector,
    events: PoolEventEmitter,
    shutdown: CancellationToken,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Bounded, health-aware pool of persistent connections.
///
/// Cloning is cheap; clones share the same pool.
///
/// # Examples
///
/// ```no_run
/// use wirepool::{ConnectionPool, PoolConfig, Priority};
///
/// # async fn demo() -> wirepool::PoolResult<()> {
/// let pool = ConnectionPool::with_websocket(PoolConfig::default())?;
/// let handle = pool.acquire("wss://stream.example.com/feed", Priority::High).await?;
/// pool.send(handle.connection_id(), "subscribe").await?;
/// pool.release(handle.connection_id(), handle.subscriber_id());
/// pool.destroy().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a pool that opens connections through `connector`.
    ///
    /// Spawns the heartbeat and idle reaper tasks, so it must be called from
    /// within a Tokio runtime.
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> PoolResult<Self> {
        config.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(PoolError::Configuration(
                "ConnectionPool must be created inside a Tokio runtime".to_string(),
            ));
        }

        let inner = Arc::new(PoolInner {
            policy: config.reconnect_policy(),
            state: Mutex::new(PoolState::new(&config)),
            metrics: MetricsCollector::new(),
            events: PoolEventEmitter::new(config.event_capacity),
            shutdown: CancellationToken::new(),
            connector,
            config,
        });
        maintenance::spawn(&inner);

        info!(
            connector = inner.connector.name(),
            max_connections = inner.config.max_connections,
            max_connections_per_host = inner.config.max_connections_per_host,
            "Connection pool started"
        );
        Ok(Self { inner })
    }

    /// Create a pool backed by [`WebSocketConnector`](crate::websocket::WebSocketConnector)
    #[cfg(feature = "websocket")]
    pub fn with_websocket(config: PoolConfig) -> PoolResult<Self> {
        Self::new(config, Arc::new(crate::websocket::WebSocketConnector::new()))
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Obtain a connection to `url`, attaching a fresh subscriber to it.
    ///
    /// Reuses an open unassigned connection to the same URL when one exists,
    /// opens a new one when both limits allow it, and otherwise waits in the
    /// pending queue for at most the request timeout.
    pub async fn acquire(&self, url: &str, priority: Priority) -> PoolResult<ConnectionHandle> {
        self.inner.acquire(url, priority, SubscriberId::new()).await
    }

    /// Like [`acquire`](Self::acquire) with a caller-chosen subscriber id
    pub async fn acquire_as(
        &self,
        url: &str,
        priority: Priority,
        subscriber: SubscriberId,
    ) -> PoolResult<ConnectionHandle> {
        self.inner.acquire(url, priority, subscriber).await
    }

    /// Detach `subscriber` from a connection. Unknown ids are ignored.
    ///
    /// Returns whether the subscriber was attached.
    pub fn release(&self, connection_id: ConnectionId, subscriber: SubscriberId) -> bool {
        self.inner.release(connection_id, subscriber)
    }

    /// Send one message on a connection
    pub async fn send(
        &self,
        connection_id: ConnectionId,
        payload: impl Into<Payload>,
    ) -> PoolResult<SendReceipt> {
        self.inner.send(connection_id, payload.into()).await
    }

    /// Register an observer for inbound messages and lifecycle events.
    ///
    /// Observing does not count as holding the connection.
    pub fn subscribe(
        &self,
        connection_id: ConnectionId,
        subscriber: SubscriberId,
    ) -> PoolResult<Subscription> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(PoolError::Shutdown);
        }
        let conn = state
            .connections
            .get_mut(&connection_id)
            .ok_or(PoolError::UnknownConnection(connection_id))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        conn.add_observer(subscriber, sender);
        debug!(connection_id = %connection_id, subscriber = %subscriber, "Observer registered");
        Ok(Subscription::new(connection_id, subscriber, receiver))
    }

    /// Drop an observer without releasing any hold on the connection
    pub fn unsubscribe(&self, connection_id: ConnectionId, subscriber: SubscriberId) -> bool {
        self.inner
            .state
            .lock()
            .connections
            .get_mut(&connection_id)
            .is_some_and(|conn| conn.remove_observer(subscriber))
    }

    /// Current pool metrics
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let (table, pending) = {
            let state = self.inner.state.lock();
            (state.table_counts(), state.queue.len())
        };
        self.inner.metrics.snapshot(table, pending)
    }

    /// Per-host counts, queue depth and configuration
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            hosts: state.hosts.snapshot(),
            total_connections: state.connections.len(),
            queue_depth: state.queue.len(),
            closed: state.closed,
            config: self.inner.config.clone(),
        }
    }

    /// Snapshot of one connection
    #[must_use]
    pub fn connection_info(&self, connection_id: ConnectionId) -> Option<ConnectionInfo> {
        let now = Instant::now();
        self.inner
            .state
            .lock()
            .connections
            .get(&connection_id)
            .map(|conn| conn.info(now))
    }

    /// Snapshots of every connection, ordered by id
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let now = Instant::now();
        let mut infos: Vec<ConnectionInfo> = self
            .inner
            .state
            .lock()
            .connections
            .values()
            .map(|conn| conn.info(now))
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Receive pool lifecycle events from now on
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Number of pooled connections
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    /// Whether the pool holds no connections
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Whether [`destroy`](Self::destroy) has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Shut the pool down.
    ///
    /// Stops background tasks, fails every queued acquire with
    /// [`PoolError::Shutdown`], removes every connection and waits for their
    /// sockets to close. Calling it again does nothing.
    pub async fn destroy(&self) {
        let (waiters, sockets) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            self.inner.shutdown.cancel();

            let waiters = state.queue.drain_all();
            let ids: Vec<ConnectionId> = state.connections.keys().copied().collect();
            let sockets: Vec<_> = ids
                .into_iter()
                .filter_map(|id| {
                    self.inner
                        .detach_connection(&mut state, id, RemovalReason::Shutdown)
                        .map(|socket| (id, socket))
                })
                .collect();
            (waiters, sockets)
        };

        let rejected = waiters.len();
        for waiter in waiters {
            let _ = waiter.respond(Err(PoolError::Shutdown));
        }

        let closing = sockets.len();
        futures::future::join_all(sockets.into_iter().map(|(id, socket)| async move {
            if let Err(e) = socket.close().await {
                warn!(connection_id = %id, error = %e, "Socket close failed during shutdown");
            }
        }))
        .await;

        info!(
            closed_connections = closing,
            rejected_requests = rejected,
            "Connection pool destroyed"
        );
    }
}

impl PoolInner {
    /// Release path shared by the public API
    fn release(self: &Arc<Self>, connection_id: ConnectionId, subscriber: SubscriberId) -> bool {
        let mut state = self.state.lock();
        let Some(conn) = state.connections.get_mut(&connection_id) else {
            debug!(connection_id = %connection_id, "Release for unknown connection ignored");
            return false;
        };

        let (was_attached, went_idle) = conn.detach(subscriber);
        debug!(
            connection_id = %connection_id,
            subscriber = %subscriber,
            went_idle,
            "Subscriber released"
        );
        if went_idle {
            self.drain_queue(&mut state);
        }
        was_attached
    }

    async fn send(
        self: &Arc<Self>,
        connection_id: ConnectionId,
        payload: Payload,
    ) -> PoolResult<SendReceipt> {
        let (socket, generation) = {
            let state = self.state.lock();
            if state.closed {
                return Err(PoolError::Shutdown);
            }
            let conn = state
                .connections
                .get(&connection_id)
                .ok_or(PoolError::UnknownConnection(connection_id))?;
            if !matches!(
                conn.state(),
                ConnectionState::Connected | ConnectionState::Busy
            ) {
                return Err(PoolError::NotConnected(connection_id));
            }
            let socket = conn
                .socket()
                .ok_or(PoolError::NotConnected(connection_id))?;
            (socket, conn.generation())
        };

        let bytes = payload.len();
        let started = Instant::now();
        let result = socket.send(payload).await;
        let latency = started.elapsed();

        match result {
            Ok(()) => {
                if let Some(conn) = self.state.lock().connections.get_mut(&connection_id) {
                    conn.record_send(bytes, latency);
                }
                self.metrics.record_send(bytes, latency);
                Ok(SendReceipt {
                    connection_id,
                    bytes,
                    latency,
                })
            }
            Err(error) => {
                warn!(connection_id = %connection_id, error = %error, "Send failed");
                self.on_failure(connection_id, generation, Failure::Error(error.clone()));
                Err(PoolError::Transport(error))
            }
        }
    }

    fn emit(&self, event: PoolEvent) {
        self.events.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{OpenOptions, OpenedSocket, TransportError, TransportResult};
    use async_trait::async_trait;
    use url::Url;

    #[derive(Debug)]
    struct RefusingConnector;

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn open(&self, _url: &Url, _options: &OpenOptions) -> TransportResult<OpenedSocket> {
            Err(TransportError::ConnectionFailed("refused".to_string()))
        }
    }

    fn pool() -> ConnectionPool {
        ConnectionPool::new(PoolConfig::default(), Arc::new(RefusingConnector)).unwrap()
    }

    #[test]
    fn test_new_requires_runtime() {
        let result = ConnectionPool::new(PoolConfig::default(), Arc::new(RefusingConnector));
        assert!(matches!(result, Err(PoolError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let config = PoolConfig {
            max_connections: 0,
            ..PoolConfig::default()
        };
        assert!(ConnectionPool::new(config, Arc::new(RefusingConnector)).is_err());
    }

    #[tokio::test]
    async fn test_handshake_failure_surfaces_and_cleans_up() {
        let pool = pool();
        let err = pool
            .acquire("ws://refused.example/", Priority::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::HandshakeFailed { .. }));
        assert!(pool.is_empty());
        assert_eq!(pool.metrics().failed_connections, 1);
        assert!(pool.status().hosts.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let pool = pool();
        let err = pool.acquire("::nope::", Priority::Low).await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_unknown_connection_operations() {
        let pool = pool();
        let id = ConnectionId::new(99);
        assert!(!pool.release(id, SubscriberId::new()));
        assert!(!pool.unsubscribe(id, SubscriberId::new()));
        assert!(matches!(
            pool.send(id, "x").await,
            Err(PoolError::UnknownConnection(_))
        ));
        assert!(matches!(
            pool.subscribe(id, SubscriberId::new()),
            Err(PoolError::UnknownConnection(_))
        ));
        assert!(pool.connection_info(id).is_none());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let pool = pool();
        pool.destroy().await;
        pool.destroy().await;
        assert!(pool.is_closed());
        assert!(pool.status().closed);
        assert!(matches!(
            pool.acquire("ws://a.example/", Priority::High).await,
            Err(PoolError::Shutdown)
        ));
    }
}
