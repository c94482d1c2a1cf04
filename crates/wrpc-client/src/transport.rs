// ABOUTME: Frame-level transport seam between the codec and the wire.
// ABOUTME: Implements text frames over a tokio-tungstenite WebSocket stream.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Failure at the frame transport level.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,

    /// Any other read/write failure.
    #[error("{0}")]
    Io(String),
}

/// A full-duplex, message-oriented connection carrying one frame per message.
///
/// Implementations are exclusively owned by one [`Connection`](crate::Connection);
/// nothing here is shared across tasks.
#[async_trait]
pub trait FrameTransport: Send {
    /// Write one text frame.
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Read the next data frame, skipping control frames.
    async fn recv_text(&mut self) -> Result<String, TransportError>;

    /// Close the connection. Closing an already-closed transport is not an error.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// WebSocket stream as returned by the upgrade handshake.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`FrameTransport`] over an upgraded WebSocket.
pub struct WsTransport {
    inner: WsStream,
}

impl WsTransport {
    pub fn new(inner: WsStream) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> WsStream {
        self.inner
    }
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport").finish_non_exhaustive()
    }
}

fn map_ws_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Closed
        }
        other => TransportError::Io(other.to_string()),
    }
}

#[async_trait]
impl FrameTransport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.inner
            .send(Message::text(text))
            .await
            .map_err(map_ws_error)
    }

    async fn recv_text(&mut self) -> Result<String, TransportError> {
        loop {
            let msg = match self.inner.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(map_ws_error(e)),
                None => return Err(TransportError::Closed),
            };
            match msg {
                Message::Text(text) => return Ok(text.as_str().to_owned()),
                Message::Binary(bytes) => {
                    return String::from_utf8(bytes.to_vec())
                        .map_err(|e| TransportError::Io(format!("binary frame is not UTF-8: {e}")));
                }
                Message::Close(frame) => {
                    tracing::debug!(?frame, "peer sent close frame");
                    return Err(TransportError::Closed);
                }
                // tungstenite answers pings itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.inner.close(None).await {
            Ok(()) => Ok(()),
            Err(e) => match map_ws_error(e) {
                TransportError::Closed => Ok(()),
                other => Err(other),
            },
        }
    }
}
