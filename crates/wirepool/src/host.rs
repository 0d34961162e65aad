//! Host keys and the per-host connection index.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::Serialize;
use url::Url;

use crate::connection::ConnectionId;
use crate::error::{PoolError, PoolResult};

/// Scheme plus authority of a target URL, used for per-host accounting.
///
/// Default ports and paths do not distinguish hosts: `ws://a.example:80/x`
/// and `ws://a.example/y` share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct HostKey(String);

impl HostKey {
    /// Derive the key for a parsed URL
    pub fn from_url(url: &Url) -> PoolResult<Self> {
        let host = url.host_str().ok_or_else(|| PoolError::InvalidUrl {
            url: url.to_string(),
            reason: "URL has no host".to_string(),
        })?;
        let key = match url.port() {
            Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
            None => format!("{}://{}", url.scheme(), host),
        };
        Ok(Self(key))
    }

    /// Borrow the key as a string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parse an acquire target into its URL and host key
pub(crate) fn parse_target(raw: &str) -> PoolResult<(Url, HostKey)> {
    let url = Url::parse(raw).map_err(|e| PoolError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    let host = HostKey::from_url(&url)?;
    Ok((url, host))
}

/// Which connections belong to which host
#[derive(Debug, Default)]
pub(crate) struct HostIndex {
    buckets: HashMap<HostKey, HashSet<ConnectionId>>,
}

impl HostIndex {
    pub(crate) fn insert(&mut self, host: HostKey, id: ConnectionId) {
        self.buckets.entry(host).or_default().insert(id);
    }

    /// Remove `id` from the host bucket, dropping the bucket once empty
    pub(crate) fn remove(&mut self, host: &HostKey, id: ConnectionId) -> bool {
        let Some(bucket) = self.buckets.get_mut(host) else {
            return false;
        };
        let removed = bucket.remove(&id);
        if bucket.is_empty() {
            self.buckets.remove(host);
        }
        removed
    }

    pub(crate) fn count(&self, host: &HostKey) -> usize {
        self.buckets.get(host).map_or(0, HashSet::len)
    }

    pub(crate) fn ids(&self, host: &HostKey) -> impl Iterator<Item = ConnectionId> + '_ {
        self.buckets.get(host).into_iter().flatten().copied()
    }

    /// Per-host counts, sorted by host for stable output
    pub(crate) fn snapshot(&self) -> BTreeMap<String, usize> {
        self.buckets
            .iter()
            .map(|(host, ids)| (host.to_string(), ids.len()))
            .collect()
    }
}
