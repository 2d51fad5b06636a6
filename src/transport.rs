//! Bidirectional frame transport
//!
//! Sessions read and write through [`FrameSource`] and [`FrameSink`] so the
//! orchestrator runs the same over an axum WebSocket or an in-memory pair.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::{Error, Result};

/// Unit read from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundUnit {
    Text(String),
    Binary(Vec<u8>),
}

/// Unit written to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundUnit {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Read half of a transport
#[async_trait]
pub trait FrameSource: Send {
    /// Next data unit, or `None` once the peer has closed
    async fn recv(&mut self) -> Option<Result<InboundUnit>>;
}

/// Write half of a transport
#[async_trait]
pub trait FrameSink: Send {
    /// Write one unit, waiting for transport flow control
    ///
    /// # Errors
    ///
    /// Returns error if the peer is gone or the write fails
    async fn send(&mut self, unit: OutboundUnit) -> Result<()>;
}

/// Split an upgraded WebSocket into transport halves
#[must_use]
pub fn split_websocket(socket: WebSocket) -> (WsSink, WsSource) {
    let (sink, stream) = socket.split();
    (WsSink { inner: sink }, WsSource { inner: stream })
}

/// WebSocket read half
pub struct WsSource {
    inner: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> Option<Result<InboundUnit>> {
        while let Some(msg) = self.inner.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    return Some(Ok(InboundUnit::Text(text.as_str().to_owned())));
                }
                Ok(Message::Binary(data)) => return Some(Ok(InboundUnit::Binary(data.to_vec()))),
                // axum answers pings itself
                Ok(Message::Ping(_) | Message::Pong(_)) => {}
                Ok(Message::Close(frame)) => {
                    if let Some(frame) = frame {
                        tracing::debug!(
                            code = frame.code,
                            reason = frame.reason.as_str(),
                            "peer closed"
                        );
                    }
                    return None;
                }
                Err(e) => return Some(Err(Error::Transport(e.to_string()))),
            }
        }
        None
    }
}

/// WebSocket write half
pub struct WsSink {
    inner: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, unit: OutboundUnit) -> Result<()> {
        let message = match unit {
            OutboundUnit::Text(text) => Message::Text(text.into()),
            OutboundUnit::Binary(data) => Message::Binary(data.into()),
            OutboundUnit::Close { code, reason } => Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })),
        };
        self.inner
            .send(message)
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }
}

/// In-memory transport, used by tests and local tooling
///
/// Returns the gateway-side halves and the device-side endpoint. Each
/// direction is a bounded channel, so a slow reader applies backpressure.
#[must_use]
pub fn memory_pair(capacity: usize) -> (MemorySink, MemorySource, ClientEnd) {
    let (to_gateway, from_client) = mpsc::channel(capacity);
    let (to_client, from_gateway) = mpsc::channel(capacity);
    (
        MemorySink { tx: to_client },
        MemorySource { rx: from_client },
        ClientEnd {
            tx: Some(to_gateway),
            rx: from_gateway,
        },
    )
}

/// Gateway-side read half of [`memory_pair`]
pub struct MemorySource {
    rx: mpsc::Receiver<InboundUnit>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Option<Result<InboundUnit>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Gateway-side write half of [`memory_pair`]
pub struct MemorySink {
    tx: mpsc::Sender<OutboundUnit>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, unit: OutboundUnit) -> Result<()> {
        self.tx
            .send(unit)
            .await
            .map_err(|_| Error::Transport("peer disconnected".to_string()))
    }
}

/// Device-side endpoint of [`memory_pair`]
pub struct ClientEnd {
    tx: Option<mpsc::Sender<InboundUnit>>,
    rx: mpsc::Receiver<OutboundUnit>,
}

impl ClientEnd {
    /// Send a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if the gateway side has gone away
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(InboundUnit::Text(text.into())).await
    }

    /// Send a binary frame
    ///
    /// # Errors
    ///
    /// Returns error if the gateway side has gone away
    pub async fn send_binary(&self, data: Vec<u8>) -> Result<()> {
        self.send(InboundUnit::Binary(data)).await
    }

    async fn send(&self, unit: InboundUnit) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::Transport("client end closed".to_string()))?;
        tx.send(unit)
            .await
            .map_err(|_| Error::Transport("gateway disconnected".to_string()))
    }

    /// Receive the next unit written by the gateway
    pub async fn recv(&mut self) -> Option<OutboundUnit> {
        self.rx.recv().await
    }

    /// Close the device's write direction, as a peer close would
    pub fn close(&mut self) {
        self.tx = None;
    }

    /// Drop the read direction so gateway writes fail
    pub fn hang_up(&mut self) {
        self.rx.close();
    }
}
