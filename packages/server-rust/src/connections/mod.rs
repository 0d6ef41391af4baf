//! The concurrent connection-management subsystem.
//!
//! Structure, leaves first: [`error`] defines the taxonomy, [`transport`]
//! the frame seam to the wire, [`connection`] the polymorphic endpoint
//! surface, [`websocket`] and [`http`] the two endpoint kinds, [`manager`]
//! the per-channel registry of endpoints, and [`registry`] the process-wide
//! sharded map from channel hash-id to manager.

pub mod connection;
pub mod error;
pub mod http;
pub mod manager;
pub mod registry;
pub mod transport;
pub mod websocket;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{Connection, ConnectionMetadata};
pub use error::{ConnectionError, TransportError};
pub use http::{HttpConnection, HttpVariant};
pub use manager::ConnectionManager;
pub use registry::{ChannelRegistry, RegistryError};
pub use transport::{split_websocket, FrameReader, FrameWriter};
pub use websocket::WebsocketConnection;
