//! Transports: how the pool reaches a URL.
//!
//! A transport is reduced to a pair of Tokio channels so the pool never
//! touches sockets directly and tests can substitute an in-memory link.

use crate::error::{Result, SwitchboardError};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Something received from the remote side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportFrame {
    /// A JSON text frame.
    Text(String),
    /// The transport failed. The channel is treated as closed.
    Error(String),
    /// The remote side closed, with its reason if it gave one.
    Closed(Option<String>),
}

/// An open transport.
///
/// Dropping every clone of `outbound` closes the transport. A closed
/// `inbound` channel reads as a remote close.
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<TransportFrame>,
}

/// Opens transports.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<TransportLink>;
}

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Clone, Debug)]
pub struct WebSocketConnector {
    buffer: usize,
}

impl WebSocketConnector {
    pub fn new() -> Self {
        Self { buffer: 256 }
    }

    /// Frames buffered in each direction.
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
        }
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<TransportLink> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| SwitchboardError::Transport {
                channel: url.to_string(),
                message: format!("WebSocket connect: {e}"),
            })?;

        let (mut ws_tx, mut ws_rx) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(self.buffer);
        let (in_tx, in_rx) = mpsc::channel::<TransportFrame>(self.buffer);
        let url = url.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outbound = out_rx.recv() => {
                        let Some(text) = outbound else {
                            // Pool let go of the link
                            let _ = ws_tx.close().await;
                            break;
                        };
                        if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                            let _ = in_tx.send(TransportFrame::Error(e.to_string())).await;
                            break;
                        }
                    }
                    inbound = ws_rx.next() => {
                        let frame = match inbound {
                            Some(Ok(Message::Text(text))) => TransportFrame::Text(text.to_string()),
                            Some(Ok(Message::Close(close))) => {
                                TransportFrame::Closed(close.map(|c| c.reason.to_string()))
                            }
                            // Control and binary frames are not part of the protocol
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => TransportFrame::Error(e.to_string()),
                            None => TransportFrame::Closed(None),
                        };
                        let terminal = !matches!(frame, TransportFrame::Text(_));
                        if in_tx.send(frame).await.is_err() || terminal {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(url = %url, "WebSocket transport task finished");
        });

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
