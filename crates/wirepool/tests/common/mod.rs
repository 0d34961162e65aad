//! Shared test utilities for pool integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use url::Url;

use wirepool::{
    ConnectionPool, Connector, OpenOptions, OpenedSocket, Payload, PoolConfig, Socket,
    SocketEventEmitter, TransportError, TransportResult,
};

/// Knobs shared by a [`MockConnector`] and every socket it opens
#[derive(Debug, Default)]
pub struct MockControls {
    /// Handshakes attempted, successful or not
    pub opens: AtomicUsize,
    /// Fail every handshake while set
    pub refuse: AtomicBool,
    /// Fail every ping while set
    pub fail_pings: AtomicBool,
    /// Fail every send while set
    pub fail_sends: AtomicBool,
    handshake_delay: Mutex<Duration>,
    send_latency: Mutex<Duration>,
}

/// In-memory connector with scripted behaviour
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    pub controls: Arc<MockControls>,
    sockets: Arc<Mutex<Vec<Arc<MockSocket>>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opens(&self) -> usize {
        self.controls.opens.load(Ordering::SeqCst)
    }

    pub fn refuse(&self, refuse: bool) {
        self.controls.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn fail_pings(&self, fail: bool) {
        self.controls.fail_pings.store(fail, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.controls.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn set_handshake_delay(&self, delay: Duration) {
        *self.controls.handshake_delay.lock() = delay;
    }

    pub fn set_send_latency(&self, latency: Duration) {
        *self.controls.send_latency.lock() = latency;
    }

    /// Socket opened by the n-th successful handshake
    pub fn socket(&self, index: usize) -> Arc<MockSocket> {
        Arc::clone(&self.sockets.lock()[index])
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.lock().len()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, url: &Url, _options: &OpenOptions) -> TransportResult<OpenedSocket> {
        self.controls.opens.fetch_add(1, Ordering::SeqCst);
        // Refusal is decided when the handshake starts
        let refuse = self.controls.refuse.load(Ordering::SeqCst);
        let delay = *self.controls.handshake_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if refuse {
            return Err(TransportError::ConnectionFailed(format!(
                "{url} refused the handshake"
            )));
        }

        let (emitter, events) = SocketEventEmitter::new();
        let socket = Arc::new(MockSocket {
            url: url.to_string(),
            controls: Arc::clone(&self.controls),
            emitter: Mutex::new(Some(emitter)),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            stall_pings: AtomicBool::new(false),
        });
        self.sockets.lock().push(Arc::clone(&socket));
        Ok(OpenedSocket {
            socket: socket as Arc<dyn Socket>,
            events,
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Socket that records sends and answers pings with pongs
#[derive(Debug)]
pub struct MockSocket {
    pub url: String,
    controls: Arc<MockControls>,
    emitter: Mutex<Option<SocketEventEmitter>>,
    sent: Mutex<Vec<Payload>>,
    closed: AtomicBool,
    stall_pings: AtomicBool,
}

impl MockSocket {
    pub fn sent(&self) -> Vec<Payload> {
        self.sent.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Make pings on this socket never complete, like a peer that stopped
    /// draining its receive window
    pub fn stall_pings(&self) {
        self.stall_pings.store(true, Ordering::SeqCst);
    }

    /// Deliver an inbound message as if the peer had sent it
    pub fn inject_message(&self, payload: impl Into<Payload>) {
        if let Some(emitter) = self.emitter.lock().as_ref() {
            emitter.emit_message(payload.into());
        }
    }

    /// Report a transport error
    pub fn inject_error(&self, message: &str) {
        if let Some(emitter) = self.emitter.lock().as_ref() {
            emitter.emit_error(TransportError::ConnectionLost(message.to_string()));
        }
    }

    /// Close from the peer side
    pub fn inject_close(&self, reason: &str) {
        if let Some(emitter) = self.emitter.lock().take() {
            emitter.emit_closed(Some(reason.to_string()));
        }
    }
}

#[async_trait]
impl Socket for MockSocket {
    async fn send(&self, payload: Payload) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::SendFailed("socket is closed".to_string()));
        }
        if self.controls.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("scripted write failure".to_string()));
        }
        let latency = *self.controls.send_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.sent.lock().push(payload);
        Ok(())
    }

    async fn ping(&self) -> TransportResult<()> {
        if self.stall_pings.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.is_closed() {
            return Err(TransportError::PingFailed("socket is closed".to_string()));
        }
        if self.controls.fail_pings.load(Ordering::SeqCst) {
            return Err(TransportError::PingFailed("scripted ping failure".to_string()));
        }
        if let Some(emitter) = self.emitter.lock().as_ref() {
            emitter.emit_pong();
        }
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.emitter.lock().take();
        Ok(())
    }
}

/// Config with short timings suited to paused-clock tests
pub fn test_config() -> PoolConfig {
    PoolConfig::builder()
        .max_connections(10)
        .max_connections_per_host(2)
        .connection_timeout(Duration::from_secs(5))
        .request_timeout(Duration::from_secs(5))
        .heartbeat_interval(Duration::from_secs(30))
        .reconnect_delay(Duration::from_millis(100), Duration::from_secs(5))
        .build()
        .expect("test config is valid")
}

pub fn pool_with(config: PoolConfig) -> (ConnectionPool, MockConnector) {
    let connector = MockConnector::new();
    let pool = ConnectionPool::new(config, Arc::new(connector.clone())).expect("pool starts");
    (pool, connector)
}

/// Let spawned tasks run without advancing the paused clock much
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
