//! Error taxonomy for the connection subsystem.

use devicehub_core::CodecError;

/// Errors surfaced by managers and connections.
///
/// Transport failures are fatal to their connection only: they trigger the
/// close path and are logged once at the terminal transition, never
/// propagated past the owning manager. Send-time errors go back to the
/// caller. Nothing here is retried internally.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection manager is closed")]
    ClosedManager,

    #[error("connection is closed")]
    ClosedConnection,

    #[error("write queue is full")]
    QueueFull,

    #[error("timed out waiting for write queue space")]
    RequestTimeout,

    #[error("timed out waiting for the response")]
    ResponseTimeout,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("superseded by a newer poll for the same device")]
    Superseded,

    #[error("unsupported message handler: {0}")]
    UnknownHandler(String),
}

/// Failures at the frame transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket transport error: {0}")]
    Websocket(String),

    #[error("malformed frame: {0}")]
    Codec(#[from] CodecError),

    #[error("transport closed")]
    Closed,
}
