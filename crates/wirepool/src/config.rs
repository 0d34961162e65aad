//! Pool configuration.
//!
//! [`PoolConfig`] is plain data with serde defaults, so it can come from a
//! builder, a config file, or `WIREPOOL_*` environment variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::OpenOptions;
use crate::error::{PoolError, PoolResult};
use crate::robustness::ReconnectPolicy;

/// Prefix for environment overrides, e.g. `WIREPOOL_MAX_CONNECTIONS`
pub const ENV_PREFIX: &str = "WIREPOOL";

/// Connection pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on pooled connections across all hosts
    pub max_connections: usize,
    /// Upper bound on pooled connections per host
    pub max_connections_per_host: usize,
    /// Handshake timeout in milliseconds
    pub connection_timeout_ms: u64,
    /// How long a queued acquire may wait, in milliseconds.
    /// Falls back to `connection_timeout_ms`.
    pub request_timeout_ms: Option<u64>,
    /// Heartbeat period in milliseconds. Idle connections are evicted after
    /// twice this period.
    pub heartbeat_interval_ms: u64,
    /// Reconnect backoff unit in milliseconds
    pub reconnect_delay_ms: u64,
    /// Cap on a single reconnect delay in milliseconds
    pub max_reconnect_delay_ms: u64,
    /// Consecutive reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
    /// Random stretch applied to reconnect delays (0.0 - 1.0)
    pub reconnect_jitter: f64,
    /// Bound on the pending acquire queue
    pub max_pending_requests: usize,
    /// Ask peers for per-message compression
    pub enable_compression: bool,
    /// Wire protocol revision announced during the handshake
    pub protocol_version: u8,
    /// Buffer size of the pool event channel
    pub event_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_connections_per_host: 10,
            connection_timeout_ms: 30_000,
            request_timeout_ms: None,
            heartbeat_interval_ms: 30_000,
            reconnect_delay_ms: 1_000,
            max_reconnect_delay_ms: 30_000,
            max_reconnect_attempts: 5,
            reconnect_jitter: 0.0,
            max_pending_requests: 1_000,
            enable_compression: false,
            protocol_version: 13,
            event_capacity: 256,
        }
    }
}

impl PoolConfig {
    /// Start a builder from the defaults
    #[must_use]
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::new()
    }

    /// Load from an optional file, then apply `WIREPOOL_*` overrides
    pub fn load(path: Option<&Path>) -> PoolResult<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        let settings = builder
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pool cannot operate with
    pub fn validate(&self) -> PoolResult<()> {
        let fail = |msg: &str| Err(PoolError::Configuration(msg.to_string()));

        if self.max_connections == 0 {
            return fail("max_connections must be greater than zero");
        }
        if self.max_connections_per_host == 0 {
            return fail("max_connections_per_host must be greater than zero");
        }
        if self.max_connections_per_host > self.max_connections {
            return fail("max_connections_per_host cannot exceed max_connections");
        }
        if self.connection_timeout_ms == 0 {
            return fail("connection_timeout_ms must be greater than zero");
        }
        if self.request_timeout_ms == Some(0) {
            return fail("request_timeout_ms must be greater than zero");
        }
        if self.heartbeat_interval_ms == 0 {
            return fail("heartbeat_interval_ms must be greater than zero");
        }
        if self.reconnect_delay_ms > self.max_reconnect_delay_ms {
            return fail("reconnect_delay_ms cannot exceed max_reconnect_delay_ms");
        }
        if !(0.0..=1.0).contains(&self.reconnect_jitter) {
            return fail("reconnect_jitter must be between 0.0 and 1.0");
        }
        if self.max_pending_requests == 0 {
            return fail("max_pending_requests must be greater than zero");
        }
        Ok(())
    }

    /// Handshake timeout
    #[must_use]
    pub const fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Queue wait limit
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.unwrap_or(self.connection_timeout_ms))
    }

    /// Heartbeat period
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// How long an unused connection survives
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.saturating_mul(2))
    }

    /// Backoff schedule for reconnects
    #[must_use]
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts,
            base_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_delay: Duration::from_millis(self.max_reconnect_delay_ms),
            backoff_multiplier: 2.0,
            jitter_factor: self.reconnect_jitter,
        }
    }

    /// Handshake parameters for connectors
    #[must_use]
    pub const fn open_options(&self) -> OpenOptions {
        OpenOptions {
            handshake_timeout: self.connection_timeout(),
            enable_compression: self.enable_compression,
            protocol_version: self.protocol_version,
        }
    }
}

/// Builder for pool configurations
#[derive(Debug, Clone, Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    /// Create a new config builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the global connection limit
    #[must_use]
    pub const fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Set the per-host connection limit
    #[must_use]
    pub const fn max_connections_per_host(mut self, max: usize) -> Self {
        self.config.max_connections_per_host = max;
        self
    }

    /// Set handshake timeout
    #[must_use]
    pub const fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set how long a queued acquire may wait
    #[must_use]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Set heartbeat period
    #[must_use]
    pub const fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set reconnect backoff unit and cap
    #[must_use]
    pub const fn reconnect_delay(mut self, base: Duration, max: Duration) -> Self {
        self.config.reconnect_delay_ms = base.as_millis() as u64;
        self.config.max_reconnect_delay_ms = max.as_millis() as u64;
        self
    }

    /// Set reconnect attempt budget
    #[must_use]
    pub const fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.max_reconnect_attempts = attempts;
        self
    }

    /// Set reconnect jitter factor
    #[must_use]
    pub const fn reconnect_jitter(mut self, factor: f64) -> Self {
        self.config.reconnect_jitter = factor;
        self
    }

    /// Set pending queue bound
    #[must_use]
    pub const fn max_pending_requests(mut self, max: usize) -> Self {
        self.config.max_pending_requests = max;
        self
    }

    /// Enable per-message compression
    #[must_use]
    pub const fn enable_compression(mut self) -> Self {
        self.config.enable_compression = true;
        self
    }

    /// Set announced protocol revision
    #[must_use]
    pub const fn protocol_version(mut self, version: u8) -> Self {
        self.config.protocol_version = version;
        self
    }

    /// Set event channel capacity
    #[must_use]
    pub const fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Build the configuration
    pub fn build(self) -> PoolResult<PoolConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
