//! Frame transport seam between connections and the wire.
//!
//! The connection state machine pumps [`Message`] frames through the
//! [`FrameReader`]/[`FrameWriter`] pair and never touches the socket type
//! directly. Production uses the axum WebSocket adapter below; tests use an
//! in-memory duplex.

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use devicehub_core::{Message, MessageKind};

use super::error::TransportError;

/// Read side of a device transport. Owned by the connection's reader task.
#[async_trait]
pub trait FrameReader: Send + 'static {
    /// Waits for the next inbound frame.
    ///
    /// Returns `Ok(None)` when the peer closed the transport cleanly.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] on I/O failure or a malformed frame.
    async fn next_frame(&mut self) -> Result<Option<Message>, TransportError>;
}

/// Write side of a device transport. Owned by the connection's writer task.
#[async_trait]
pub trait FrameWriter: Send + 'static {
    /// Writes one frame.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] on I/O failure.
    async fn send_frame(&mut self, msg: &Message) -> Result<(), TransportError>;

    /// Writes a close control frame. Best-effort: the peer may already be
    /// gone.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] on I/O failure.
    async fn send_close(&mut self) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// axum WebSocket adapter
// ---------------------------------------------------------------------------

/// Splits an upgraded axum WebSocket into boxed frame halves.
#[must_use]
pub fn split_websocket(socket: WebSocket) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
    let (sink, stream) = socket.split();
    (
        Box::new(WsFrameReader { stream }),
        Box::new(WsFrameWriter { sink }),
    )
}

struct WsFrameReader {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameReader for WsFrameReader {
    async fn next_frame(&mut self) -> Result<Option<Message>, TransportError> {
        match self.stream.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(TransportError::Websocket(e.to_string())),
            Some(Ok(WsMessage::Binary(frame))) => Ok(Some(Message::decode(&frame)?)),
            Some(Ok(WsMessage::Text(text))) => Ok(Some(Message::decode(text.as_bytes())?)),
            Some(Ok(WsMessage::Ping(payload))) => Ok(Some(Message::ping(payload))),
            Some(Ok(WsMessage::Pong(payload))) => Ok(Some(Message::pong(payload))),
            Some(Ok(WsMessage::Close(_))) => Ok(None),
        }
    }
}

struct WsFrameWriter {
    sink: SplitSink<WebSocket, WsMessage>,
}

#[async_trait]
impl FrameWriter for WsFrameWriter {
    async fn send_frame(&mut self, msg: &Message) -> Result<(), TransportError> {
        // Keepalive frames map to protocol-level control frames; everything
        // else is an encoded binary frame.
        let ws_msg = match msg.kind {
            MessageKind::Ping => WsMessage::Ping(msg.payload.clone()),
            MessageKind::Pong => WsMessage::Pong(msg.payload.clone()),
            _ => WsMessage::Binary(msg.encode().map_err(TransportError::Codec)?),
        };
        self.sink
            .send(ws_msg)
            .await
            .map_err(|e| TransportError::Websocket(e.to_string()))
    }

    async fn send_close(&mut self) -> Result<(), TransportError> {
        self.sink
            .send(WsMessage::Close(None))
            .await
            .map_err(|e| TransportError::Websocket(e.to_string()))
    }
}
