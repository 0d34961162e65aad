//! Background maintenance: heartbeats and idle eviction.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio::time::{Instant, MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::PoolInner;
use super::lifecycle::Failure;
use crate::connection::{ConnectionId, ConnectionState};
use crate::core::TransportError;
use crate::events::RemovalReason;

/// Start the heartbeat and reaper loops. Both stop on shutdown or once the
/// pool is dropped.
pub(super) fn spawn(inner: &Arc<PoolInner>) {
    let period = inner.config.heartbeat_interval();

    tokio::spawn(run_every(
        Arc::downgrade(inner),
        inner.shutdown.clone(),
        period,
        |pool| async move { pool.heartbeat().await },
    ));
    tokio::spawn(run_every(
        Arc::downgrade(inner),
        inner.shutdown.clone(),
        period,
        |pool| async move {
            pool.reap();
        },
    ));
}

/// Call `tick` every `period`, the first time one period from now
async fn run_every<F, Fut>(
    pool: Weak<PoolInner>,
    shutdown: CancellationToken,
    period: Duration,
    tick: F,
) where
    F: Fn(Arc<PoolInner>) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let Some(pool) = pool.upgrade() else {
            break;
        };
        tick(pool).await;
    }
}

impl PoolInner {
    /// Ping every open connection once. A ping that errors or outlasts the
    /// connection timeout goes through the normal failure path as soon as it
    /// settles; pongs raise health when the reader sees them.
    pub(super) async fn heartbeat(self: Arc<Self>) {
        let targets: Vec<_> = {
            let state = self.state.lock();
            state
                .connections
                .values()
                .filter(|conn| conn.state().is_open())
                .filter_map(|conn| conn.socket().map(|socket| (conn.id(), conn.generation(), socket)))
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        let probes = targets.len();
        let deadline = self.config.connection_timeout();
        let outcomes = join_all(targets.into_iter().map(|(id, generation, socket)| {
            let pool = Arc::clone(&self);
            async move {
                let error = match timeout(deadline, socket.ping()).await {
                    Ok(Ok(())) => return false,
                    Ok(Err(error)) => error,
                    Err(_) => TransportError::PingFailed("ping timed out".to_string()),
                };
                warn!(connection_id = %id, error = %error, "Heartbeat failed");
                pool.on_failure(id, generation, Failure::Error(error));
                true
            }
        }))
        .await;

        let failed = outcomes.into_iter().filter(|failed| *failed).count();
        debug!(probes, failed, "Heartbeat sweep finished");
    }

    /// Evict connections idle past the idle timeout and expire stale queued
    /// acquires. Returns the number of evicted connections.
    pub(super) fn reap(self: Arc<Self>) -> usize {
        let idle_timeout = self.config.idle_timeout();
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.closed {
            return 0;
        }

        let expired: Vec<ConnectionId> = state
            .connections
            .values()
            .filter(|conn| {
                conn.state() == ConnectionState::Idle
                    && !conn.has_subscribers()
                    && conn.idle_for(now) > idle_timeout
            })
            .map(|conn| conn.id())
            .collect();

        for id in &expired {
            self.remove_connection(&mut state, *id, RemovalReason::Idle);
        }

        let stale = state.queue.take_stale(now);
        let stale_count = stale.len();
        for (key, request) in stale {
            self.discard_request(key, request, now);
        }

        if !expired.is_empty() || stale_count > 0 {
            debug!(
                evicted = expired.len(),
                expired_requests = stale_count,
                "Reaper sweep finished"
            );
        }
        if !expired.is_empty() {
            self.drain_queue(&mut state);
        }
        expired.len()
    }
}
