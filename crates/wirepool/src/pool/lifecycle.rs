//! Connection lifecycle: handshakes, inbound events, failures and reconnects.
//!
//! Every socket gets a generation number. Reader tasks, in-flight sends and
//! heartbeats carry the generation they started with, and anything reported
//! against an older generation is ignored.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use url::Url;

use super::admission::Waiter;
use super::{PoolInner, PoolState};
use crate::connection::{ConnectionEvent, ConnectionId, ConnectionState};
use crate::core::{OpenedSocket, Payload, Socket, SocketEvent, TransportError};
use crate::error::{PoolError, PoolResult};
use crate::events::{PoolEvent, RemovalReason};

/// How an established socket stopped working
#[derive(Debug, Clone)]
pub(super) enum Failure {
    Error(TransportError),
    Closed(Option<String>),
}

impl PoolInner {
    /// Run the connector under `connection_timeout`
    async fn open_socket(&self, url: &Url) -> PoolResult<OpenedSocket> {
        let options = self.config.open_options();
        let timeout = self.config.connection_timeout();
        match tokio::time::timeout(timeout, self.connector.open(url, &options)).await {
            Ok(Ok(opened)) => Ok(opened),
            Ok(Err(source)) => Err(PoolError::HandshakeFailed {
                url: url.to_string(),
                source,
            }),
            Err(_) => Err(PoolError::HandshakeTimeout {
                url: url.to_string(),
                timeout,
            }),
        }
    }

    pub(super) async fn run_handshake(
        self: Arc<Self>,
        id: ConnectionId,
        url: Url,
        waiter: Option<Waiter>,
    ) {
        let result = self.open_socket(&url).await;
        let mut state = self.state.lock();
        match result {
            Ok(opened) => self.complete_handshake(&mut state, id, opened, waiter),
            Err(error) => self.fail_handshake(&mut state, id, error, waiter),
        }
    }

    fn complete_handshake(
        self: &Arc<Self>,
        state: &mut PoolState,
        id: ConnectionId,
        opened: OpenedSocket,
        waiter: Option<Waiter>,
    ) {
        let OpenedSocket { socket, events } = opened;
        let conn = match state.connections.get_mut(&id) {
            Some(conn) if !state.closed => conn,
            _ => {
                debug!(connection_id = %id, "Handshake finished after shutdown, closing socket");
                self.close_in_background(id, socket);
                if let Some(waiter) = waiter {
                    let _ = waiter.responder.send(Err(PoolError::Shutdown));
                }
                return;
            }
        };

        let generation = conn.install_socket(socket);
        conn.set_reader(self.spawn_reader(id, generation, events));
        let delivered = waiter.is_some_and(|waiter| Self::deliver(conn, waiter));
        conn.settle();

        let host = conn.host().clone();
        info!(connection_id = %id, host = %host, state = %conn.state(), "Connection established");
        self.emit(PoolEvent::ConnectionOpened {
            connection_id: id,
            host,
        });

        if !delivered {
            self.drain_queue(state);
        }
    }

    fn fail_handshake(
        self: &Arc<Self>,
        state: &mut PoolState,
        id: ConnectionId,
        error: PoolError,
        waiter: Option<Waiter>,
    ) {
        let Some(conn) = state.connections.get_mut(&id) else {
            if let Some(waiter) = waiter {
                let _ = waiter.responder.send(Err(PoolError::Shutdown));
            }
            return;
        };
        conn.mark_failed();
        let host = conn.host().clone();

        warn!(connection_id = %id, host = %host, error = %error, "Handshake failed");
        self.metrics.record_failure();
        self.emit(PoolEvent::HandshakeFailed {
            connection_id: id,
            host,
            error: error.to_string(),
        });
        self.remove_connection(state, id, RemovalReason::HandshakeFailed);

        if let Some(waiter) = waiter {
            let _ = waiter.responder.send(Err(error));
        }
        self.drain_queue(state);
    }

    /// Forward socket events into the pool until the stream ends
    fn spawn_reader(
        self: &Arc<Self>,
        id: ConnectionId,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<SocketEvent>,
    ) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(pool) = pool.upgrade() else {
                    return;
                };
                match event {
                    SocketEvent::Message(payload) => pool.on_message(id, generation, payload),
                    SocketEvent::Pong => pool.on_pong(id, generation),
                    SocketEvent::Error(error) => {
                        pool.on_failure(id, generation, Failure::Error(error));
                        return;
                    }
                    SocketEvent::Closed { reason } => {
                        pool.on_failure(id, generation, Failure::Closed(reason));
                        return;
                    }
                }
            }
            if let Some(pool) = pool.upgrade() {
                let reason = Some("event stream ended".to_string());
                pool.on_failure(id, generation, Failure::Closed(reason));
            }
        })
    }

    fn on_message(&self, id: ConnectionId, generation: u64, payload: Payload) {
        let mut state = self.state.lock();
        let Some(conn) = state.connections.get_mut(&id) else {
            return;
        };
        if conn.generation() != generation {
            return;
        }
        let bytes = payload.len();
        conn.record_receive(bytes);
        self.metrics.record_receive(bytes);
        conn.notify(&ConnectionEvent::Message(payload));
    }

    fn on_pong(&self, id: ConnectionId, generation: u64) {
        let mut state = self.state.lock();
        if let Some(conn) = state.connections.get_mut(&id)
            && conn.generation() == generation
        {
            let score = conn.reward();
            trace!(connection_id = %id, health_score = score, "Heartbeat acknowledged");
        }
    }

    /// Entry point for every transport fault on an established socket
    pub(super) fn on_failure(self: &Arc<Self>, id: ConnectionId, generation: u64, failure: Failure) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let Some(conn) = state.connections.get_mut(&id) else {
            return;
        };
        if conn.generation() != generation || !conn.state().is_open() {
            trace!(connection_id = %id, "Ignoring failure from a stale socket");
            return;
        }

        match failure {
            Failure::Error(error) => {
                let health_score = conn.penalize();
                warn!(connection_id = %id, error = %error, health_score, "Transport error");
                conn.notify(&ConnectionEvent::Error(error));
                self.emit(PoolEvent::HealthDegraded {
                    connection_id: id,
                    health_score,
                });
            }
            Failure::Closed(reason) => {
                info!(
                    connection_id = %id,
                    reason = reason.as_deref().unwrap_or("none"),
                    "Connection closed"
                );
            }
        }

        if let Some(socket) = conn.take_socket() {
            self.close_in_background(id, socket);
        }
        self.recover_or_remove(&mut state, id);
    }

    /// Schedule a reconnect if someone still holds the connection and the
    /// attempt budget allows it, otherwise remove it.
    ///
    /// The fault that starts an outage is not an attempt. With
    /// `max_reconnect_attempts = n` a held connection is removed after n
    /// failed reopens, which is n + 1 consecutive transport failures counting
    /// the original fault. A successful reopen resets the count.
    fn recover_or_remove(self: &Arc<Self>, state: &mut PoolState, id: ConnectionId) {
        let Some(conn) = state.connections.get_mut(&id) else {
            return;
        };

        if conn.has_subscribers() && self.policy.allows(conn.reconnect_attempts()) {
            let (attempt, ticket) = conn.begin_reconnect();
            let delay = self.policy.delay_for(attempt);
            let url = conn.url().clone();

            self.metrics.record_reconnect_attempt();
            warn!(
                connection_id = %id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect"
            );
            self.emit(PoolEvent::Reconnecting {
                connection_id: id,
                attempt,
                delay_ms: delay.as_millis() as u64,
            });

            let pool = Arc::clone(self);
            tokio::spawn(async move {
                pool.run_reconnect(id, ticket, url, delay).await;
            });
            return;
        }

        let reason = if conn.has_subscribers() {
            RemovalReason::ReconnectExhausted
        } else {
            RemovalReason::TransportFailure
        };
        conn.mark_failed();
        self.metrics.record_failure();
        self.remove_connection(state, id, reason);
        self.drain_queue(state);
    }

    async fn run_reconnect(
        self: Arc<Self>,
        id: ConnectionId,
        ticket: u64,
        url: Url,
        delay: Duration,
    ) {
        tokio::select! {
            () = self.shutdown.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
        if !self.reconnect_pending(id, ticket) {
            return;
        }

        debug!(connection_id = %id, url = %url, "Reconnecting");
        let result = self.open_socket(&url).await;

        let mut state = self.state.lock();
        if !state.closed && state_matches(&state, id, ticket) {
            match result {
                Ok(opened) => self.complete_reconnect(&mut state, id, opened),
                Err(error) => {
                    if let Some(conn) = state.connections.get_mut(&id) {
                        let health_score = conn.penalize();
                        warn!(connection_id = %id, error = %error, health_score, "Reconnect attempt failed");
                        self.emit(PoolEvent::HealthDegraded {
                            connection_id: id,
                            health_score,
                        });
                    }
                    self.recover_or_remove(&mut state, id);
                }
            }
        } else if let Ok(opened) = result {
            self.close_in_background(id, opened.socket);
        }
    }

    fn reconnect_pending(&self, id: ConnectionId, ticket: u64) -> bool {
        let state = self.state.lock();
        !state.closed && state_matches(&state, id, ticket)
    }

    fn complete_reconnect(self: &Arc<Self>, state: &mut PoolState, id: ConnectionId, opened: OpenedSocket) {
        let OpenedSocket { socket, events } = opened;
        let Some(conn) = state.connections.get_mut(&id) else {
            self.close_in_background(id, socket);
            return;
        };

        let attempts = conn.reconnect_attempts();
        let generation = conn.install_socket(socket);
        conn.set_reader(self.spawn_reader(id, generation, events));
        conn.settle();
        conn.notify(&ConnectionEvent::Reconnected { attempts });
        let went_idle = conn.state() == ConnectionState::Idle;

        self.metrics.record_reconnect_success();
        info!(connection_id = %id, attempts, "Connection restored");
        self.emit(PoolEvent::Reconnected {
            connection_id: id,
            attempts,
        });

        if went_idle {
            self.drain_queue(state);
        }
    }

    /// Take a connection out of the table and both indices, notifying its
    /// observers. The caller decides how to close the returned socket.
    pub(super) fn detach_connection(
        &self,
        state: &mut PoolState,
        id: ConnectionId,
        reason: RemovalReason,
    ) -> Option<Arc<dyn Socket>> {
        let mut conn = state.connections.remove(&id)?;
        state.hosts.remove(conn.host(), id);
        let socket = conn.take_socket();
        conn.close_observers(reason);
        self.metrics.record_connection_removed();

        info!(connection_id = %id, host = %conn.host(), reason = %reason, "Connection removed");
        self.emit(PoolEvent::ConnectionRemoved {
            connection_id: id,
            host: conn.host().clone(),
            reason,
        });
        socket
    }

    /// Remove a connection and close its socket in the background
    pub(super) fn remove_connection(&self, state: &mut PoolState, id: ConnectionId, reason: RemovalReason) {
        if let Some(socket) = self.detach_connection(state, id, reason) {
            self.close_in_background(id, socket);
        }
    }

    fn close_in_background(&self, id: ConnectionId, socket: Arc<dyn Socket>) {
        tokio::spawn(async move {
            if let Err(e) = socket.close().await {
                debug!(connection_id = %id, error = %e, "Socket close failed");
            }
        });
    }
}

/// The entry still exists, is waiting to reconnect, and `ticket` is current
fn state_matches(state: &PoolState, id: ConnectionId, ticket: u64) -> bool {
    state.connections.get(&id).is_some_and(|conn| {
        conn.generation() == ticket && conn.state() == ConnectionState::Reconnecting
    })
}
