//! Acquire path: reuse, creation under limits, and the pending queue.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use super::{PoolInner, PoolState};
use crate::connection::{ConnectionHandle, ConnectionId, PooledConnection, SubscriberId};
use crate::error::{PoolError, PoolResult};
use crate::events::PoolEvent;
use crate::host::{self, HostKey};
use crate::queue::{ConnectionRequest, Priority, QueueKey};

/// Caller waiting on a handshake it triggered
#[derive(Debug)]
pub(super) struct Waiter {
    pub(super) subscriber: SubscriberId,
    pub(super) responder: oneshot::Sender<PoolResult<ConnectionHandle>>,
}

/// What `drain_queue` decided for the head-most serviceable request
enum Plan {
    Discard,
    Reuse(ConnectionId),
    Open,
}

impl PoolState {
    /// Healthiest open unassigned connection to exactly `url`, newest on ties
    pub(super) fn best_reusable(&self, url: &Url, host: &HostKey) -> Option<ConnectionId> {
        self.hosts
            .ids(host)
            .filter_map(|id| self.connections.get(&id))
            .filter(|conn| conn.url() == url && conn.state().is_reusable())
            .max_by_key(|conn| (conn.health(), conn.id()))
            .map(PooledConnection::id)
    }

    pub(super) fn has_capacity(&self, host: &HostKey, max_total: usize, max_per_host: usize) -> bool {
        self.connections.len() < max_total && self.hosts.count(host) < max_per_host
    }
}

impl PoolInner {
    pub(super) async fn acquire(
        self: &Arc<Self>,
        raw_url: &str,
        priority: Priority,
        subscriber: SubscriberId,
    ) -> PoolResult<ConnectionHandle> {
        let (url, host) = host::parse_target(raw_url)?;

        let (queued, receiver) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PoolError::Shutdown);
            }

            if let Some(id) = state.best_reusable(&url, &host)
                && let Some(conn) = state.connections.get_mut(&id)
            {
                conn.attach(subscriber);
                debug!(connection_id = %id, host = %host, "Reusing pooled connection");
                return Ok(conn.handle_for(subscriber));
            }

            let (responder, receiver) = oneshot::channel();
            if self.has_capacity(&state, &host) {
                let waiter = Waiter {
                    subscriber,
                    responder,
                };
                self.start_connection(&mut state, url.clone(), host.clone(), Some(waiter));
                (None, receiver)
            } else {
                let deadline = Instant::now() + self.config.request_timeout();
                let request = ConnectionRequest::new(
                    url.clone(),
                    host.clone(),
                    priority,
                    subscriber,
                    deadline,
                    responder,
                );
                let key = state.queue.push(request)?;
                let queue_depth = state.queue.len();
                debug!(
                    request_id = %key.id(),
                    host = %host,
                    priority = %priority,
                    queue_depth,
                    "No capacity, acquire queued"
                );
                self.emit(PoolEvent::RequestQueued {
                    request_id: key.id(),
                    host: host.clone(),
                    priority,
                    queue_depth,
                });
                (Some((key, deadline)), receiver)
            }
        };

        match queued {
            // The handshake task always answers the waiter, bounded by connection_timeout.
            None => receiver.await.unwrap_or(Err(PoolError::Shutdown)),
            Some((key, deadline)) => {
                self.await_queued(key, deadline, receiver, &url, &host, priority)
                    .await
            }
        }
    }

    async fn await_queued(
        self: &Arc<Self>,
        key: QueueKey,
        deadline: Instant,
        mut receiver: oneshot::Receiver<PoolResult<ConnectionHandle>>,
        url: &Url,
        host: &HostKey,
        priority: Priority,
    ) -> PoolResult<ConnectionHandle> {
        let enqueued_at = Instant::now();
        match tokio::time::timeout_at(deadline, &mut receiver).await {
            Ok(result) => result.unwrap_or(Err(PoolError::Shutdown)),
            Err(_) => {
                let removed = self.state.lock().queue.remove(&key);
                if removed.is_none() {
                    // Serviced or expired by the pool under the lock; the outcome is already sent.
                    return receiver.try_recv().unwrap_or_else(|_| {
                        Err(PoolError::RequestTimeout {
                            url: url.to_string(),
                            waited: enqueued_at.elapsed(),
                        })
                    });
                }

                let waited = enqueued_at.elapsed();
                self.metrics.record_queue_timeout();
                warn!(
                    request_id = %key.id(),
                    host = %host,
                    priority = %priority,
                    waited_ms = waited.as_millis() as u64,
                    "Queued acquire timed out"
                );
                self.emit(PoolEvent::RequestTimedOut {
                    request_id: key.id(),
                    host: host.clone(),
                    priority,
                    waited_ms: waited.as_millis() as u64,
                });
                Err(PoolError::RequestTimeout {
                    url: url.to_string(),
                    waited,
                })
            }
        }
    }

    pub(super) fn has_capacity(&self, state: &PoolState, host: &HostKey) -> bool {
        state.has_capacity(
            host,
            self.config.max_connections,
            self.config.max_connections_per_host,
        )
    }

    /// Insert a `Connecting` entry and spawn its handshake
    pub(super) fn start_connection(
        self: &Arc<Self>,
        state: &mut PoolState,
        url: Url,
        host: HostKey,
        waiter: Option<Waiter>,
    ) -> ConnectionId {
        state.next_connection_id += 1;
        let id = ConnectionId::new(state.next_connection_id);

        state
            .connections
            .insert(id, PooledConnection::new(id, url.clone(), host.clone()));
        state.hosts.insert(host.clone(), id);
        self.metrics.record_connection_created();

        debug!(connection_id = %id, host = %host, "Opening connection");
        self.emit(PoolEvent::ConnectionCreated {
            connection_id: id,
            host,
        });

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.run_handshake(id, url, waiter).await;
        });
        id
    }

    /// Hand an open connection to a waiter.
    ///
    /// Returns `false` and leaves the connection unassigned if the waiter has
    /// gone away.
    pub(super) fn deliver(conn: &mut PooledConnection, waiter: Waiter) -> bool {
        conn.attach(waiter.subscriber);
        let handle = conn.handle_for(waiter.subscriber);
        if waiter.responder.send(Ok(handle)).is_err() {
            conn.detach(waiter.subscriber);
            return false;
        }
        true
    }

    /// Service queued requests in priority order while capacity allows.
    ///
    /// A request whose host is saturated does not block requests behind it
    /// that can be served.
    pub(super) fn drain_queue(self: &Arc<Self>, state: &mut PoolState) {
        if state.closed || state.queue.is_empty() {
            return;
        }

        loop {
            let now = Instant::now();
            let next = {
                let view: &PoolState = state;
                view.queue.iter().find_map(|(key, request)| {
                    if request.is_abandoned() || request.is_expired(now) {
                        Some((*key, Plan::Discard))
                    } else if let Some(id) = view.best_reusable(&request.url, &request.host) {
                        Some((*key, Plan::Reuse(id)))
                    } else if self.has_capacity(view, &request.host) {
                        Some((*key, Plan::Open))
                    } else {
                        None
                    }
                })
            };
            let Some((key, plan)) = next else {
                break;
            };
            let Some(request) = state.queue.remove(&key) else {
                break;
            };

            match plan {
                Plan::Discard => self.discard_request(key, request, now),
                Plan::Reuse(id) => {
                    let Some(conn) = state.connections.get_mut(&id) else {
                        continue;
                    };
                    let (_, _, subscriber, responder) = request.into_parts();
                    if Self::deliver(conn, Waiter { subscriber, responder }) {
                        debug!(
                            request_id = %key.id(),
                            connection_id = %id,
                            "Queued acquire served by pooled connection"
                        );
                    }
                }
                Plan::Open => {
                    let (url, host, subscriber, responder) = request.into_parts();
                    debug!(request_id = %key.id(), host = %host, "Queued acquire opening a connection");
                    self.start_connection(state, url, host, Some(Waiter { subscriber, responder }));
                }
            }
        }
    }

    /// Drop a request that can no longer be served
    pub(super) fn discard_request(&self, key: QueueKey, request: ConnectionRequest, now: Instant) {
        if request.is_abandoned() {
            debug!(request_id = %key.id(), "Dropping abandoned acquire");
            return;
        }

        let waited = now.saturating_duration_since(request.enqueued_at);
        self.metrics.record_queue_timeout();
        warn!(
            request_id = %key.id(),
            host = %request.host,
            priority = %request.priority,
            waited_ms = waited.as_millis() as u64,
            "Queued acquire expired"
        );
        self.emit(PoolEvent::RequestTimedOut {
            request_id: key.id(),
            host: request.host.clone(),
            priority: request.priority,
            waited_ms: waited.as_millis() as u64,
        });
        let url = request.url.to_string();
        let _ = request.respond(Err(PoolError::RequestTimeout { url, waited }));
    }
}
