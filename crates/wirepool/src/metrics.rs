//! Pool metrics collection and reporting.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionState;

/// Smoothing factor of the latency moving average
pub const LATENCY_EMA_ALPHA: f64 = 0.1;

/// Exponential moving average of send latency in milliseconds.
///
/// The first sample seeds the average.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyEma {
    alpha: f64,
    value: Option<f64>,
}

impl LatencyEma {
    /// Create an empty average with the given smoothing factor
    #[must_use]
    pub const fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    /// Fold in a sample and return the new average
    pub fn update(&mut self, sample_ms: f64) -> f64 {
        let next = match self.value {
            Some(current) => self.alpha * sample_ms + (1.0 - self.alpha) * current,
            None => sample_ms,
        };
        self.value = Some(next);
        next
    }

    /// Current average, `0.0` before the first sample
    #[must_use]
    pub fn value(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }
}

impl Default for LatencyEma {
    fn default() -> Self {
        Self::new(LATENCY_EMA_ALPHA)
    }
}

/// Cumulative counters kept for the lifetime of the pool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolCounters {
    /// Connection entries created
    pub connections_created: u64,
    /// Connection entries removed
    pub connections_removed: u64,
    /// Handshake failures plus connections lost for good
    pub connections_failed: u64,
    /// Reconnect attempts scheduled
    pub reconnect_attempts: u64,
    /// Successful reconnects
    pub reconnects_succeeded: u64,
    /// Messages sent
    pub messages_sent: u64,
    /// Messages received
    pub messages_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Queued acquires that hit their deadline
    pub queue_timeouts: u64,
}

/// Connection counts derived from the pool table at snapshot time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCounts {
    /// Entries in the table
    pub total: usize,
    /// Busy connections
    pub active: usize,
    /// Idle connections
    pub idle: usize,
    /// Handshakes in flight
    pub connecting: usize,
    /// Connections waiting to reconnect
    pub reconnecting: usize,
}

impl TableCounts {
    /// Tally a set of connection states
    pub fn tally(states: impl IntoIterator<Item = ConnectionState>) -> Self {
        let mut counts = Self::default();
        for state in states {
            counts.total += 1;
            match state {
                ConnectionState::Busy => counts.active += 1,
                ConnectionState::Idle | ConnectionState::Connected => counts.idle += 1,
                ConnectionState::Connecting => counts.connecting += 1,
                ConnectionState::Reconnecting => counts.reconnecting += 1,
                ConnectionState::Failed => {}
            }
        }
        counts
    }
}

/// Point-in-time pool metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolMetrics {
    /// Entries in the table
    pub total_connections: usize,
    /// Busy connections
    pub active_connections: usize,
    /// Idle connections
    pub idle_connections: usize,
    /// Handshakes in flight
    pub connecting_connections: usize,
    /// Connections waiting to reconnect
    pub reconnecting_connections: usize,
    /// Cumulative failures
    pub failed_connections: u64,
    /// Acquires waiting in the queue
    pub pending_requests: usize,
    /// Messages sent
    pub total_messages: u64,
    /// Bytes sent plus bytes received
    pub total_bytes: u64,
    /// Moving average of send latency
    pub average_latency_ms: f64,
    /// Cumulative counters
    pub counters: PoolCounters,
    /// Seconds since the collector was created
    pub uptime_seconds: u64,
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
}

/// Collects pool metrics from every task that touches the pool
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    counters: Arc<RwLock<PoolCounters>>,
    latency: Arc<RwLock<LatencyEma>>,
    start_time: Instant,
}

impl MetricsCollector {
    /// Create a new metrics collector
    #[must_use]
    pub fn new() -> Self {
        Self {
            counters: Arc::new(RwLock::new(PoolCounters::default())),
            latency: Arc::new(RwLock::new(LatencyEma::default())),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection entry
    pub fn record_connection_created(&self) {
        self.counters.write().connections_created += 1;
        #[cfg(feature = "metrics")]
        ::metrics::counter!("wirepool_connections_created_total").increment(1);
    }

    /// Record a removed connection entry
    pub fn record_connection_removed(&self) {
        self.counters.write().connections_removed += 1;
        #[cfg(feature = "metrics")]
        ::metrics::counter!("wirepool_connections_removed_total").increment(1);
    }

    /// Record a handshake failure or a connection lost for good
    pub fn record_failure(&self) {
        self.counters.write().connections_failed += 1;
        #[cfg(feature = "metrics")]
        ::metrics::counter!("wirepool_connections_failed_total").increment(1);
    }

    /// Record a scheduled reconnect attempt
    pub fn record_reconnect_attempt(&self) {
        self.counters.write().reconnect_attempts += 1;
        #[cfg(feature = "metrics")]
        ::metrics::counter!("wirepool_reconnect_attempts_total").increment(1);
    }

    /// Record a successful reconnect
    pub fn record_reconnect_success(&self) {
        self.counters.write().reconnects_succeeded += 1;
    }

    /// Record a queued acquire that timed out
    pub fn record_queue_timeout(&self) {
        self.counters.write().queue_timeouts += 1;
        #[cfg(feature = "metrics")]
        ::metrics::counter!("wirepool_queue_timeouts_total").increment(1);
    }

    /// Record a completed send and fold its latency into the average
    pub fn record_send(&self, bytes: usize, latency: Duration) {
        {
            let mut counters = self.counters.write();
            counters.messages_sent += 1;
            counters.bytes_sent += bytes as u64;
        }
        let sample_ms = latency.as_secs_f64() * 1000.0;
        self.latency.write().update(sample_ms);

        #[cfg(feature = "metrics")]
        {
            ::metrics::counter!("wirepool_messages_sent_total").increment(1);
            ::metrics::counter!("wirepool_bytes_sent_total").increment(bytes as u64);
            ::metrics::histogram!("wirepool_send_latency_ms").record(sample_ms);
        }
    }

    /// Record an inbound message
    pub fn record_receive(&self, bytes: usize) {
        let mut counters = self.counters.write();
        counters.messages_received += 1;
        counters.bytes_received += bytes as u64;
        #[cfg(feature = "metrics")]
        ::metrics::counter!("wirepool_bytes_received_total").increment(bytes as u64);
    }

    /// Current latency average in milliseconds
    #[must_use]
    pub fn average_latency_ms(&self) -> f64 {
        self.latency.read().value()
    }

    /// Copy of the cumulative counters
    #[must_use]
    pub fn counters(&self) -> PoolCounters {
        self.counters.read().clone()
    }

    /// Combine the cumulative counters with table-derived counts
    #[must_use]
    pub fn snapshot(&self, table: TableCounts, pending_requests: usize) -> PoolMetrics {
        let counters = self.counters();
        #[cfg(feature = "metrics")]
        {
            ::metrics::gauge!("wirepool_connections_total").set(table.total as f64);
            ::metrics::gauge!("wirepool_connections_active").set(table.active as f64);
            ::metrics::gauge!("wirepool_pending_requests").set(pending_requests as f64);
        }
        PoolMetrics {
            total_connections: table.total,
            active_connections: table.active,
            idle_connections: table.idle,
            connecting_connections: table.connecting,
            reconnecting_connections: table.reconnecting,
            failed_connections: counters.connections_failed,
            pending_requests,
            total_messages: counters.messages_sent,
            total_bytes: counters.bytes_sent + counters.bytes_received,
            average_latency_ms: self.average_latency_ms(),
            counters,
            uptime_seconds: self.start_time.elapsed().as_secs(),
            timestamp: Utc::now(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics exporter trait for different output formats
pub trait MetricsExporter: Send + Sync {
    /// Export metrics snapshot
    fn export(&self, snapshot: &PoolMetrics) -> Result<String, Box<dyn std::error::Error>>;
}

/// Prometheus text format exporter
#[derive(Debug)]
pub struct PrometheusExporter;

impl MetricsExporter for PrometheusExporter {
    fn export(&self, snapshot: &PoolMetrics) -> Result<String, Box<dyn std::error::Error>> {
        let mut output = String::new();
        let c = &snapshot.counters;

        writeln!(output, "wirepool_connections_total {}", snapshot.total_connections)?;
        writeln!(output, "wirepool_connections_active {}", snapshot.active_connections)?;
        writeln!(output, "wirepool_connections_idle {}", snapshot.idle_connections)?;
        writeln!(
            output,
            "wirepool_connections_connecting {}",
            snapshot.connecting_connections
        )?;
        writeln!(
            output,
            "wirepool_connections_reconnecting {}",
            snapshot.reconnecting_connections
        )?;
        writeln!(output, "wirepool_pending_requests {}", snapshot.pending_requests)?;
        writeln!(output, "wirepool_connections_failed_total {}", c.connections_failed)?;
        writeln!(output, "wirepool_reconnect_attempts_total {}", c.reconnect_attempts)?;
        writeln!(output, "wirepool_queue_timeouts_total {}", c.queue_timeouts)?;
        writeln!(output, "wirepool_messages_sent_total {}", c.messages_sent)?;
        writeln!(output, "wirepool_messages_received_total {}", c.messages_received)?;
        writeln!(output, "wirepool_bytes_sent_total {}", c.bytes_sent)?;
        writeln!(output, "wirepool_bytes_received_total {}", c.bytes_received)?;
        writeln!(
            output,
            "wirepool_send_latency_ema_ms {:.3}",
            snapshot.average_latency_ms
        )?;
        writeln!(output, "wirepool_uptime_seconds {}", snapshot.uptime_seconds)?;

        Ok(output)
    }
}

/// JSON metrics exporter
#[derive(Debug)]
pub struct JsonExporter;

impl MetricsExporter for JsonExporter {
    fn export(&self, snapshot: &PoolMetrics) -> Result<String, Box<dyn std::error::Error>> {
        Ok(serde_json::to_string_pretty(snapshot)?)
    }
}
