//! Connection robustness primitives
//!
//! - [`HealthScore`]: bounded per-connection health rating fed by heartbeats
//!   and transport errors
//! - [`ReconnectPolicy`]: exponential backoff with an upper bound and optional
//!   jitter

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Health rating of a single connection, always within `0..=100`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HealthScore(u8);

impl HealthScore {
    /// Highest possible score, assigned to fresh connections
    pub const MAX: u8 = 100;
    /// Gain per successful heartbeat
    pub const HEARTBEAT_REWARD: u8 = 1;
    /// Loss per transport error
    pub const ERROR_PENALTY: u8 = 10;

    /// Create a score, clamped to `MAX`
    #[must_use]
    pub const fn new(value: u8) -> Self {
        if value > Self::MAX {
            Self(Self::MAX)
        } else {
            Self(value)
        }
    }

    /// Current value
    #[must_use]
    pub const fn value(self) -> u8 {
        self.0
    }

    /// Record a successful heartbeat
    pub fn reward(&mut self) -> u8 {
        self.0 = self.0.saturating_add(Self::HEARTBEAT_REWARD).min(Self::MAX);
        self.0
    }

    /// Record a transport error
    pub fn penalize(&mut self) -> u8 {
        self.0 = self.0.saturating_sub(Self::ERROR_PENALTY);
        self.0
    }
}

impl Default for HealthScore {
    fn default() -> Self {
        Self(Self::MAX)
    }
}

/// Backoff schedule for reconnecting a failed connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Maximum number of consecutive attempts
    pub max_attempts: u32,
    /// Delay unit for the first attempt
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 - 1.0) to avoid thundering herd
    pub jitter_factor: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }
}

impl ReconnectPolicy {
    /// Whether another attempt is allowed after `attempts` consecutive ones
    #[must_use]
    pub const fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before attempt number `attempt`, counting from 1.
    ///
    /// `base_delay * multiplier^attempt`, stretched by up to `jitter_factor`
    /// and capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_delay_ms = self.base_delay.as_millis() as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_ms = base_delay_ms * self.backoff_multiplier.powi(exponent);

        let jitter = fastrand::f64() * self.jitter_factor.clamp(0.0, 1.0);
        let jittered_delay_ms = delay_ms * (1.0 + jitter);

        let final_delay_ms = jittered_delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(final_delay_ms as u64)
    }
}
