//! The per-channel connection manager.
//!
//! One manager exists per channel (keyed by the channel's hash-id in the
//! registry) and owns the identifier → connection map. Admission fully
//! constructs the connection before taking the structural lock, swaps it
//! into the map remembering any displaced holder, and closes the displaced
//! connection asynchronously so admission never blocks on a slow teardown.
//! A closed manager admits nothing and `close` only returns once every
//! connection it held is terminal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use metrics::counter;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::debug;

use super::connection::{Connection, ConnectionMetadata};
use super::error::ConnectionError;
use super::http::{HttpConnection, HttpVariant};
use super::transport::{FrameReader, FrameWriter};
use super::websocket::WebsocketConnection;
use crate::metrics::{CONNECTIONS_DISPLACED, CONNECTIONS_OPENED};
use crate::network::config::SharedConfig;
use crate::pipeline::Handler;

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("hash_id", &self.hash_id)
            .finish_non_exhaustive()
    }
}

/// Per-channel registry of device connections.
pub struct ConnectionManager {
    hash_id: String,
    /// Read without the structural lock; set under it exactly once.
    closed: AtomicBool,
    conns: Mutex<HashMap<String, Arc<dyn Connection>>>,
    config: Arc<SharedConfig>,
}

impl ConnectionManager {
    pub(crate) fn new(hash_id: String, config: Arc<SharedConfig>) -> Arc<Self> {
        Arc::new(Self {
            hash_id,
            closed: AtomicBool::new(false),
            conns: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// The channel hash-id this manager serves.
    #[must_use]
    pub fn hash_id(&self) -> &str {
        &self.hash_id
    }

    /// Whether the manager has been closed. Lock-free.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Admits a WebSocket connection under `identifier`, displacing any
    /// prior holder (which is closed asynchronously and does not
    /// unregister — its slot now belongs to the newcomer).
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::ClosedManager`] when the manager is
    /// closed; the just-built transport is told goodbye with a close frame
    /// bounded by the write timeout.
    pub async fn new_websocket_connection(
        self: &Arc<Self>,
        identifier: String,
        reader: Box<dyn FrameReader>,
        writer: Box<dyn FrameWriter>,
        handler: Handler,
        metadata: ConnectionMetadata,
    ) -> Result<Arc<WebsocketConnection>, ConnectionError> {
        let ws_config = self.config.load().websocket.clone();
        let conn = WebsocketConnection::new(
            identifier,
            reader,
            writer,
            handler,
            metadata,
            ws_config,
            Arc::downgrade(self),
        );

        let admitted = {
            let mut conns = self.conns.lock();
            if self.closed.load(Ordering::Acquire) {
                None
            } else {
                Some(conns.insert(
                    conn.identifier().to_string(),
                    Arc::clone(&conn) as Arc<dyn Connection>,
                ))
            }
        };
        let Some(displaced) = admitted else {
            conn.discard().await;
            return Err(ConnectionError::ClosedManager);
        };

        if let Some(old) = displaced {
            counter!(CONNECTIONS_DISPLACED).increment(1);
            debug!(channel = %self.hash_id, device = %conn.identifier(), "displacing prior connection");
            tokio::spawn(async move { old.close_displaced().await });
        }

        Arc::clone(&conn).start();
        counter!(CONNECTIONS_OPENED).increment(1);
        Ok(conn)
    }

    /// Admits an HTTP connection. Push connections are never registered:
    /// the caller runs the handler and the connection self-closes. Poll
    /// connections register like WebSocket connections, displacing any
    /// prior poll (which observes `Superseded`).
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::ClosedManager`] when the manager is
    /// closed.
    pub async fn new_http_connection(
        self: &Arc<Self>,
        identifier: String,
        variant: HttpVariant,
        handler: Handler,
        metadata: ConnectionMetadata,
    ) -> Result<Arc<HttpConnection>, ConnectionError> {
        let response_timeout = self.config.load().websocket.timeouts.response;
        let conn = HttpConnection::new(
            identifier,
            variant,
            handler,
            metadata,
            response_timeout,
            Arc::downgrade(self),
        );

        match variant {
            HttpVariant::Push => {
                if self.is_closed() {
                    conn.close(false).await;
                    return Err(ConnectionError::ClosedManager);
                }
            }
            HttpVariant::Poll => {
                let admitted = {
                    let mut conns = self.conns.lock();
                    if self.closed.load(Ordering::Acquire) {
                        None
                    } else {
                        Some(conns.insert(
                            conn.identifier().to_string(),
                            Arc::clone(&conn) as Arc<dyn Connection>,
                        ))
                    }
                };
                let Some(displaced) = admitted else {
                    conn.close(false).await;
                    return Err(ConnectionError::ClosedManager);
                };
                if let Some(old) = displaced {
                    counter!(CONNECTIONS_DISPLACED).increment(1);
                    tokio::spawn(async move { old.close_displaced().await });
                }
            }
        }

        counter!(CONNECTIONS_OPENED).increment(1);
        Ok(conn)
    }

    /// Looks up the current holder of an identifier.
    #[must_use]
    pub fn find(&self, identifier: &str) -> Option<Arc<dyn Connection>> {
        self.conns.lock().get(identifier).cloned()
    }

    /// Number of registered connections.
    #[must_use]
    pub fn count(&self) -> usize {
        self.conns.lock().len()
    }

    /// Closes the manager: no further admissions, and every held connection
    /// is driven to terminal state before this returns. Idempotent. Called
    /// by the channel registry only.
    pub(crate) async fn close(&self) {
        let conns: Vec<Arc<dyn Connection>> = {
            let conns = self.conns.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            conns.values().cloned().collect()
        };

        debug!(channel = %self.hash_id, count = conns.len(), "closing connection manager");
        let mut closers = JoinSet::new();
        for conn in conns {
            closers.spawn(async move {
                conn.close(true).await;
            });
        }
        while closers.join_next().await.is_some() {}
    }

    /// Removes `identifier` from the map, but only while `serial` still
    /// owns the slot. A displaced predecessor closing late therefore never
    /// evicts its successor; redundant unregisters are no-ops.
    pub(crate) fn unregister(&self, identifier: &str, serial: u64) {
        let mut conns = self.conns.lock();
        if conns.get(identifier).is_some_and(|c| c.serial() == serial) {
            conns.remove(identifier);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
