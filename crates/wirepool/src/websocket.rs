//! WebSocket connector built on tokio-tungstenite.
//!
//! Each socket is split into a writer task that drains an ordered command
//! channel and a reader task that turns frames into [`SocketEvent`]s. A send
//! resolves once its frame has been flushed to the stream.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, trace};
use url::Url;

use crate::core::{
    Connector, OpenOptions, OpenedSocket, Payload, Socket, SocketEvent, SocketEventEmitter,
    TransportError, TransportResult,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens `ws://` and `wss://` connections
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a new WebSocket connector
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &Url, options: &OpenOptions) -> TransportResult<OpenedSocket> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Version",
            HeaderValue::from(u16::from(options.protocol_version)),
        );
        if options.enable_compression {
            debug!(url = %url, "Compression requested, frames are sent uncompressed");
        }

        let handshake = connect_async(request);
        let (stream, _response) = tokio::time::timeout(options.handshake_timeout, handshake)
            .await
            .map_err(|_| TransportError::HandshakeTimeout(options.handshake_timeout))?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        debug!(url = %url, "WebSocket handshake complete");

        Ok(WebSocketSocket::spawn(stream, url.to_string()))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

#[derive(Debug)]
enum Command {
    Frame {
        message: Message,
        ack: oneshot::Sender<TransportResult<()>>,
    },
    Close {
        ack: oneshot::Sender<TransportResult<()>>,
    },
}

/// Outbound half of a WebSocket connection
#[derive(Debug)]
pub struct WebSocketSocket {
    commands: mpsc::UnboundedSender<Command>,
    endpoint: String,
}

impl WebSocketSocket {
    /// Split an established stream into writer and reader tasks
    pub fn spawn(stream: WsStream, endpoint: String) -> OpenedSocket {
        let (sink, source) = stream.split();
        let (emitter, events) = SocketEventEmitter::new();
        let (commands, command_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(sink, command_rx));
        tokio::spawn(read_loop(source, emitter));

        OpenedSocket {
            socket: Arc::new(Self { commands, endpoint }),
            events,
        }
    }

    /// Remote endpoint
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn submit(&self, message: Message) -> TransportResult<()> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Frame { message, ack })
            .map_err(|_| TransportError::ConnectionLost("writer task has stopped".to_string()))?;
        done.await
            .map_err(|_| TransportError::ConnectionLost("writer task dropped the frame".to_string()))?
    }
}

#[async_trait]
impl Socket for WebSocketSocket {
    async fn send(&self, payload: Payload) -> TransportResult<()> {
        let message = match payload {
            Payload::Text(text) => Message::Text(text),
            Payload::Binary(data) => Message::Binary(data.to_vec()),
        };
        self.submit(message).await
    }

    async fn ping(&self) -> TransportResult<()> {
        self.submit(Message::Ping(Vec::new()))
            .await
            .map_err(|e| TransportError::PingFailed(e.to_string()))
    }

    async fn close(&self) -> TransportResult<()> {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Close { ack }).is_err() {
            return Ok(());
        }
        done.await.unwrap_or(Ok(()))
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Frame { message, ack } => {
                let result = sink
                    .send(message)
                    .await
                    .map_err(|e| TransportError::SendFailed(e.to_string()));
                let failed = result.is_err();
                let _ = ack.send(result);
                if failed {
                    break;
                }
            }
            Command::Close { ack } => {
                let result = sink
                    .close()
                    .await
                    .map_err(|e| TransportError::ConnectionLost(e.to_string()));
                let _ = ack.send(result);
                break;
            }
        }
    }
    trace!("WebSocket writer stopped");
}

async fn read_loop(mut source: SplitStream<WsStream>, emitter: SocketEventEmitter) {
    while let Some(frame) = source.next().await {
        let delivered = match frame {
            Ok(Message::Text(text)) => emitter.emit_message(Payload::Text(text)),
            Ok(Message::Binary(data)) => emitter.emit_message(Payload::Binary(Bytes::from(data))),
            Ok(Message::Pong(_)) => emitter.emit_pong(),
            Ok(Message::Close(frame)) => {
                emitter.emit_closed(frame.map(|f| f.reason.into_owned()));
                return;
            }
            Ok(Message::Ping(_) | Message::Frame(_)) => true,
            Err(e) => {
                emitter.emit(SocketEvent::Error(TransportError::ReceiveFailed(e.to_string())));
                return;
            }
        };
        if !delivered {
            trace!("Nobody listening, WebSocket reader stopped");
            return;
        }
    }
    emitter.emit_closed(None);
}
