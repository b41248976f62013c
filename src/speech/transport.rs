//! Streaming synthesis transport
//!
//! The player talks to the provider through the [`Connector`] and
//! [`Transport`] traits; [`WebSocketConnector`] is the real implementation.
//!
//! # Connection Flow
//!
//! 1. `connect()` - Establish the WebSocket (the player bounds how long this may take)
//! 2. `send_text()` - Send JSON client messages
//! 3. `recv()` - Get parsed inbound messages, then exactly one `Closed`
//! 4. `close()` - Clean shutdown (also on drop)

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{protocol::frame::coding::CloseCode, Message},
    MaybeTlsStream, WebSocketStream,
};

use super::protocol::ServerMessage;
use super::SpeechError;

/// Something that happened on the inbound side of the connection
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(ServerMessage),
    /// The connection ended; `normal` is false for errors and resets
    Closed { normal: bool, reason: String },
}

/// One open bidirectional connection
#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), SpeechError>;

    /// Next inbound event. Must be cancel-safe; yields `Closed` once the
    /// connection is gone.
    async fn recv(&mut self) -> TransportEvent;

    async fn close(&mut self);
}

/// Opens transports to a streaming endpoint
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, SpeechError>;
}

type WsWrite = futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Connector backed by `tokio-tungstenite`
///
/// No timeout of its own; the player bounds every connection attempt.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    _private: (),
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketConnector {
    pub fn new() -> Self {
        // Several rustls providers may be linked in; pick one explicitly.
        // Fails harmlessly if a provider is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        Self { _private: () }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, SpeechError> {
        log::info!("Connecting to streaming synthesis endpoint...");
        log::debug!("Endpoint: {}", url);

        let (ws_stream, _response) = connect_async_with_config(url, None, true)
            .await
            .map_err(|e| SpeechError::ConnectionFailed(e.to_string()))?;

        log::info!("WebSocket connected");

        let (write, mut read) = ws_stream.split();
        let (incoming_tx, incoming_rx) = mpsc::channel(100);

        // Background reader: parse messages, then report how the stream ended
        let receiver_task = tokio::spawn(async move {
            let closed = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        match ServerMessage::parse(&text) {
                            Ok(msg) => {
                                if incoming_tx.send(TransportEvent::Message(msg)).await.is_err() {
                                    log::debug!("Receiver channel closed");
                                    return;
                                }
                            }
                            Err(e) => {
                                log::warn!("Failed to parse message: {}", e);
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (normal, reason) = match frame {
                            Some(f) => (
                                f.code == CloseCode::Normal,
                                format!("{} {}", u16::from(f.code), f.reason),
                            ),
                            None => (true, "closed without frame".to_string()),
                        };
                        log::info!("WebSocket closed by server ({})", reason);
                        break TransportEvent::Closed { normal, reason };
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error: {}", e);
                        break TransportEvent::Closed {
                            normal: false,
                            reason: e.to_string(),
                        };
                    }
                    None => {
                        break TransportEvent::Closed {
                            normal: false,
                            reason: "stream ended without close frame".to_string(),
                        };
                    }
                    Some(Ok(_)) => {} // Ignore ping/pong/binary
                }
            };
            let _ = incoming_tx.send(closed).await;
            log::debug!("Receiver task exiting");
        });

        Ok(Box::new(WebSocketTransport {
            write,
            incoming_rx,
            receiver_task,
            closed: false,
        }))
    }
}

/// Handle to an open WebSocket
///
/// Owns the write half; inbound frames are parsed by a background task.
struct WebSocketTransport {
    write: WsWrite,
    incoming_rx: mpsc::Receiver<TransportEvent>,
    receiver_task: tokio::task::JoinHandle<()>,
    closed: bool,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send_text(&mut self, text: String) -> Result<(), SpeechError> {
        self.write
            .send(Message::Text(text))
            .await
            .map_err(|e| SpeechError::Disconnected(format!("send failed: {}", e)))
    }

    async fn recv(&mut self) -> TransportEvent {
        match self.incoming_rx.recv().await {
            Some(event) => event,
            None => TransportEvent::Closed {
                normal: false,
                reason: "receiver task ended".to_string(),
            },
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        log::info!("Closing streaming connection...");

        self.receiver_task.abort();

        if let Err(e) = self.write.close().await {
            log::debug!("Error closing WebSocket: {}", e);
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        // Ensure receiver task is aborted if dropped without close()
        self.receiver_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused_is_connection_failure() {
        let connector = WebSocketConnector::new();
        // Port 9 (discard) on localhost is almost never listening
        let result = connector.connect("ws://127.0.0.1:9/stream-input").await;

        match result {
            Err(e) => assert!(e.is_retryable(), "unexpected error: {:?}", e),
            Ok(_) => panic!("Expected connection failure"),
        }
    }

    #[tokio::test]
    async fn test_invalid_url_is_connection_failure() {
        let connector = WebSocketConnector::default();
        let result = connector.connect("not a url").await;
        assert!(matches!(result, Err(SpeechError::ConnectionFailed(_))));
    }
}
