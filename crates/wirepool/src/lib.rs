//! # Wirepool
//!
//! A bounded, health-aware pool of persistent, message-oriented connections
//! (WebSocket and anything else that can implement [`Connector`]).
//!
//! ## Features
//!
//! - **Admission control**: global and per-host connection limits, with a
//!   bounded queue of waiting acquires served by priority then arrival
//! - **Reuse**: idle connections to the same URL are handed out before new
//!   ones are opened, healthiest first
//! - **Health tracking**: heartbeats raise a per-connection score, transport
//!   errors lower it
//! - **Reconnection**: held connections are reopened under the same id with
//!   capped exponential backoff
//! - **Eviction**: connections unused for two heartbeat periods are closed
//! - **Observability**: tracing spans and fields, a metrics snapshot with
//!   Prometheus and JSON exporters, and a broadcast stream of pool events
//!
//! ## Module Organization
//!
//! ```text
//! wirepool/
//! ├── core/           # Connector and Socket traits, transport errors
//! ├── config/         # PoolConfig, builder and file/env loading
//! ├── connection/     # Connection records, handles and subscriptions
//! ├── host/           # Host keys and the per-host index
//! ├── queue/          # Priority queue of pending acquires
//! ├── robustness/     # Health score and reconnect backoff
//! ├── metrics/        # Latency average, counters and exporters
//! ├── events/         # Pool lifecycle events
//! ├── pool/           # The orchestrator and its background tasks
//! └── websocket/      # tokio-tungstenite connector
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use wirepool::{ConnectionEvent, ConnectionPool, PoolConfig, Priority};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PoolConfig::builder()
//!     .max_connections_per_host(4)
//!     .heartbeat_interval(Duration::from_secs(15))
//!     .build()?;
//! let pool = ConnectionPool::with_websocket(config)?;
//!
//! let handle = pool.acquire("wss://stream.example.com/ticks", Priority::High).await?;
//! let mut updates = pool.subscribe(handle.connection_id(), handle.subscriber_id())?;
//! pool.send(handle.connection_id(), r#"{"op":"subscribe"}"#).await?;
//!
//! while let Some(event) = updates.recv().await {
//!     if let ConnectionEvent::Message(payload) = event {
//!         println!("{:?}", payload.as_text());
//!     }
//! }
//!
//! pool.release(handle.connection_id(), handle.subscriber_id());
//! pool.destroy().await;
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,  // Intentional in metrics code
    clippy::must_use_candidate,
    clippy::return_self_not_must_use
)]

pub mod config;
pub mod connection;
pub mod core;
pub mod error;
pub mod events;
pub mod host;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod robustness;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use crate::config::{PoolConfig, PoolConfigBuilder};
pub use crate::connection::{
    ConnectionEvent, ConnectionHandle, ConnectionId, ConnectionInfo, ConnectionState,
    SendReceipt, SubscriberId, Subscription,
};
pub use crate::core::{
    Connector, OpenOptions, OpenedSocket, Payload, Socket, SocketEvent, SocketEventEmitter,
    TransportError, TransportResult,
};
pub use crate::error::{PoolError, PoolResult};
pub use crate::events::{PoolEvent, RemovalReason};
pub use crate::host::HostKey;
pub use crate::metrics::{JsonExporter, MetricsExporter, PoolMetrics, PrometheusExporter};
pub use crate::pool::{ConnectionPool, PoolStatus};
pub use crate::queue::{Priority, RequestId};
pub use crate::robustness::{HealthScore, ReconnectPolicy};

#[cfg(feature = "websocket")]
pub use crate::websocket::WebSocketConnector;
