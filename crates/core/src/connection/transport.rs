//! The socket seam under the connection manager.
//!
//! A transport turns a URL into a pair of channels. Everything the manager
//! needs to know about the socket arrives as a [`TransportEvent`]; everything
//! it writes goes out as an [`OutboundFrame`].

use crate::{error::ConnectionError, protocol::InboundFrame};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{CloseFrame, Message as WsMessage, frame::coding::CloseCode},
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Binary(Bytes),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Frame(InboundFrame),
    /// A transport error that did not (yet) close the socket.
    Error(String),
    /// The socket is gone. `code` is `None` when it closed without a close
    /// frame.
    Closed { code: Option<u16>, reason: String },
}

/// Both ends of an open socket.
#[derive(Debug)]
pub struct SocketChannels {
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &str) -> Result<SocketChannels, ConnectionError>;
}

/// WebSocket transport backed by `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteTransport;

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn open(&self, url: &str) -> Result<SocketChannels, ConnectionError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        info!(%url, "WebSocket connected");
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        // Writer: drains outbound frames until a close is written or the
        // manager drops its sender.
        let writer_events = inbound_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let (message, closing) = match frame {
                    OutboundFrame::Text(text) => (WsMessage::Text(text.into()), false),
                    OutboundFrame::Binary(data) => (WsMessage::Binary(data), false),
                    OutboundFrame::Close { code, reason } => (
                        WsMessage::Close(Some(CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        })),
                        true,
                    ),
                };
                if let Err(e) = ws_tx.send(message).await {
                    let _ = writer_events.send(TransportEvent::Error(e.to_string()));
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = ws_tx.close().await;
            debug!("WebSocket writer finished");
        });

        // Reader: forwards frames until the socket closes.
        tokio::spawn(async move {
            let closed = loop {
                match ws_rx.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        let frame = InboundFrame::Text(text.as_str().to_owned());
                        if inbound_tx.send(TransportEvent::Frame(frame)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        let frame = InboundFrame::Binary(data);
                        if inbound_tx.send(TransportEvent::Frame(frame)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        break match frame {
                            Some(frame) => TransportEvent::Closed {
                                code: Some(u16::from(frame.code)),
                                reason: frame.reason.as_str().to_owned(),
                            },
                            None => TransportEvent::Closed {
                                code: None,
                                reason: String::new(),
                            },
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Error reading from WebSocket");
                        let _ = inbound_tx.send(TransportEvent::Error(e.to_string()));
                        break TransportEvent::Closed {
                            code: None,
                            reason: e.to_string(),
                        };
                    }
                    None => {
                        break TransportEvent::Closed {
                            code: None,
                            reason: "stream ended".into(),
                        };
                    }
                }
            };
            let _ = inbound_tx.send(closed);
            debug!("WebSocket reader finished");
        });

        Ok(SocketChannels {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
