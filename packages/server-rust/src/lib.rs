//! `DeviceHub` Server — `WebSocket` gateway with per-channel connection
//! managers, a message handler pipeline, and telemetry indexing seams.

pub mod connections;
pub mod metrics;
pub mod network;
pub mod pipeline;
pub mod store;

pub use connections::{
    ChannelRegistry, Connection, ConnectionError, ConnectionManager, ConnectionMetadata,
    HttpConnection, HttpVariant, RegistryError, TransportError, WebsocketConnection,
};
pub use network::{AppState, GatewayConfig, GatewayModule, SharedConfig, ShutdownController};
pub use pipeline::{
    Handler, IndexerMiddleware, LoggerMiddleware, Middleware, MiddlewareRegistry, MiddlewareStack,
};
pub use store::{MemoryChannelStore, StoreError};
