//! The polymorphic connection surface shared by WebSocket and HTTP
//! endpoints.
//!
//! Managers store `Arc<dyn Connection>`; everything a manager, handler, or
//! admin surface needs from a connection goes through this trait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use devicehub_core::{Channel, Message};

use super::error::ConnectionError;

/// Process-wide admission serial counter. Serial 0 is never handed out so it
/// can mean "no connection" in logs.
static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique admission serial.
pub(crate) fn next_serial() -> u64 {
    NEXT_SERIAL.fetch_add(1, Ordering::Relaxed)
}

/// Metadata attached to a connection at admission.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    /// The channel this connection was admitted under.
    pub channel: Arc<Channel>,
    /// Free-form attributes (remote address, user agent, tag values).
    pub attributes: HashMap<String, String>,
}

impl ConnectionMetadata {
    #[must_use]
    pub fn new(channel: Arc<Channel>) -> Self {
        Self {
            channel,
            attributes: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// A live device endpoint registered (or registrable) with a manager.
///
/// `close` runs the full teardown and only returns once the connection is
/// terminal, so `wait` after `close` never blocks. Do not call `close` from
/// inside a message handler — handlers run on the reader task, which `close`
/// waits for; spawn a task instead.
#[async_trait]
pub trait Connection: Send + Sync {
    /// The device identifier this connection is registered under.
    fn identifier(&self) -> &str;

    /// Process-unique admission serial, used to guard unregistration so a
    /// displaced predecessor can never evict its successor.
    fn serial(&self) -> u64;

    /// When the connection was created.
    fn created_at(&self) -> Instant;

    /// When the connection last heard from its peer.
    fn last_active(&self) -> Instant;

    /// Admission metadata.
    fn metadata(&self) -> &ConnectionMetadata;

    /// Sends a message to the device.
    ///
    /// With `expect_response`, blocks until the matching response arrives
    /// (up to the `response` timeout) and returns its payload. Without it,
    /// returns `Ok(None)` once the message is enqueued.
    ///
    /// # Errors
    ///
    /// See [`ConnectionError`]; not every endpoint supports every send mode.
    async fn send(
        &self,
        msg: Message,
        expect_response: bool,
    ) -> Result<Option<Bytes>, ConnectionError>;

    /// Drives the connection to terminal state. Idempotent; every caller
    /// returns after the connection is fully closed. `unregister` controls
    /// whether the connection removes itself from its manager's map.
    async fn close(&self, unregister: bool);

    /// Close because a newer connection took this identifier. Equivalent to
    /// `close(false)` except that endpoints with a parked waiter resolve it
    /// with `Superseded` instead of `ClosedConnection`.
    async fn close_displaced(&self);

    /// Waits until the connection is terminal. Returns immediately if it
    /// already is.
    async fn wait(&self);
}
