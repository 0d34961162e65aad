//! Pending acquire requests, ordered by priority and arrival.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use url::Url;

use crate::connection::{ConnectionHandle, SubscriberId};
use crate::error::{PoolError, PoolResult};
use crate::host::HostKey;

/// Acquire priority. Higher priorities are serviced first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work
    Low,
    /// Default priority
    #[default]
    Normal,
    /// Latency-sensitive work
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        })
    }
}

impl FromStr for Priority {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(PoolError::Configuration(format!(
                "unknown priority '{other}', expected low, normal or high"
            ))),
        }
    }
}

/// Identifier of a queued acquire request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Position in the queue: priority descending, then arrival ascending
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct QueueKey {
    priority: Reverse<Priority>,
    id: RequestId,
}

impl QueueKey {
    pub(crate) const fn id(&self) -> RequestId {
        self.id
    }
}

/// An acquire that could not be satisfied immediately
#[derive(Debug)]
pub(crate) struct ConnectionRequest {
    pub(crate) url: Url,
    pub(crate) host: HostKey,
    pub(crate) priority: Priority,
    pub(crate) subscriber: SubscriberId,
    pub(crate) enqueued_at: Instant,
    pub(crate) deadline: Instant,
    responder: oneshot::Sender<PoolResult<ConnectionHandle>>,
}

impl ConnectionRequest {
    pub(crate) fn new(
        url: Url,
        host: HostKey,
        priority: Priority,
        subscriber: SubscriberId,
        deadline: Instant,
        responder: oneshot::Sender<PoolResult<ConnectionHandle>>,
    ) -> Self {
        Self {
            url,
            host,
            priority,
            subscriber,
            enqueued_at: Instant::now(),
            deadline,
            responder,
        }
    }

    /// The caller stopped waiting
    pub(crate) fn is_abandoned(&self) -> bool {
        self.responder.is_closed()
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Split into target, subscriber and the channel back to the caller
    pub(crate) fn into_parts(
        self,
    ) -> (
        Url,
        HostKey,
        SubscriberId,
        oneshot::Sender<PoolResult<ConnectionHandle>>,
    ) {
        (self.url, self.host, self.subscriber, self.responder)
    }

    /// Deliver the outcome. Gives the result back if the caller is gone.
    pub(crate) fn respond(
        self,
        result: PoolResult<ConnectionHandle>,
    ) -> Result<(), PoolResult<ConnectionHandle>> {
        self.responder.send(result)
    }
}

/// Bounded priority queue of [`ConnectionRequest`]s
#[derive(Debug)]
pub(crate) struct PendingQueue {
    entries: BTreeMap<QueueKey, ConnectionRequest>,
    next_id: u64,
    capacity: usize,
}

impl PendingQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 0,
            capacity,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Enqueue a request, failing with `PoolExhausted` once at capacity
    pub(crate) fn push(&mut self, request: ConnectionRequest) -> PoolResult<QueueKey> {
        if self.entries.len() >= self.capacity {
            return Err(PoolError::PoolExhausted(format!(
                "pending request queue is full ({} waiting)",
                self.capacity
            )));
        }
        self.next_id += 1;
        let key = QueueKey {
            priority: Reverse(request.priority),
            id: RequestId(self.next_id),
        };
        self.entries.insert(key, request);
        Ok(key)
    }

    pub(crate) fn remove(&mut self, key: &QueueKey) -> Option<ConnectionRequest> {
        self.entries.remove(key)
    }

    /// Requests in service order
    pub(crate) fn iter(&self) -> impl Iterator<Item = (&QueueKey, &ConnectionRequest)> {
        self.entries.iter()
    }

    /// Remove every request whose deadline has passed or whose caller is gone
    pub(crate) fn take_stale(&mut self, now: Instant) -> Vec<(QueueKey, ConnectionRequest)> {
        let stale: Vec<QueueKey> = self
            .entries
            .iter()
            .filter(|(_, request)| request.is_expired(now) || request.is_abandoned())
            .map(|(key, _)| *key)
            .collect();
        stale
            .into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|request| (key, request)))
            .collect()
    }

    /// Empty the queue, returning requests in service order
    pub(crate) fn drain_all(&mut self) -> Vec<ConnectionRequest> {
        std::mem::take(&mut self.entries).into_values().collect()
    }
}
