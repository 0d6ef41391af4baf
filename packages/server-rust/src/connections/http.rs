//! One-shot HTTP connections: push and long-poll.
//!
//! Push serves a single inbound message: the handler chain runs and the
//! connection self-closes without ever touching the manager map. Poll is
//! the inverse: the connection registers and parks on a single-shot
//! delivery slot until a message is sent to it, the `response` timeout
//! expires, it is displaced by a newer poll (observing `Superseded`), or
//! its manager closes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use devicehub_core::Message;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::connection::{next_serial, Connection, ConnectionMetadata};
use super::error::ConnectionError;
use super::manager::ConnectionManager;

const RUNNING: u64 = 0;
const CLOSED: u64 = 2;

/// The two HTTP interaction shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVariant {
    /// Device POSTs one message; the handler runs; never registered.
    Push,
    /// Device long-polls for one message destined to its identifier.
    Poll,
}

type Delivery = Result<Bytes, ConnectionError>;

impl std::fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnection")
            .field("identifier", &self.identifier)
            .field("serial", &self.serial)
            .field("variant", &self.variant)
            .finish_non_exhaustive()
    }
}

/// A single-interaction device connection.
pub struct HttpConnection {
    identifier: String,
    serial: u64,
    created_at: Instant,
    metadata: ConnectionMetadata,
    handler: crate::pipeline::Handler,
    variant: HttpVariant,
    manager: Weak<ConnectionManager>,
    response_timeout: Duration,

    state: AtomicU64,
    delivery_tx: Mutex<Option<oneshot::Sender<Delivery>>>,
    delivery_rx: Mutex<Option<oneshot::Receiver<Delivery>>>,
    done: CancellationToken,
}

impl HttpConnection {
    pub(crate) fn new(
        identifier: String,
        variant: HttpVariant,
        handler: crate::pipeline::Handler,
        metadata: ConnectionMetadata,
        response_timeout: Duration,
        manager: Weak<ConnectionManager>,
    ) -> Arc<Self> {
        let (tx, rx) = oneshot::channel();
        Arc::new(Self {
            identifier,
            serial: next_serial(),
            created_at: Instant::now(),
            metadata,
            handler,
            variant,
            manager,
            response_timeout,
            state: AtomicU64::new(RUNNING),
            delivery_tx: Mutex::new(Some(tx)),
            delivery_rx: Mutex::new(Some(rx)),
            done: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn variant(&self) -> HttpVariant {
        self.variant
    }

    /// Runs the handler chain over one inbound message (push flow).
    pub async fn process(self: Arc<Self>, msg: Message) {
        let as_dyn: Arc<dyn Connection> = Arc::clone(&self) as Arc<dyn Connection>;
        (self.handler)(as_dyn, msg).await;
    }

    /// Parks until a message is delivered to this poll connection, then
    /// deregisters and closes. Single use: a second call observes the
    /// connection as closed.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::ResponseTimeout`] when nothing arrives in time,
    /// [`ConnectionError::Superseded`] when a newer poll displaced this one,
    /// [`ConnectionError::ClosedConnection`] when the connection was closed
    /// while parked.
    pub async fn await_delivery(&self) -> Result<Bytes, ConnectionError> {
        let rx = self.delivery_rx.lock().take();
        let Some(rx) = rx else {
            return Err(ConnectionError::ClosedConnection);
        };

        let outcome = match tokio::time::timeout(self.response_timeout, rx).await {
            Ok(Ok(delivery)) => delivery,
            Ok(Err(_)) => Err(ConnectionError::ClosedConnection),
            Err(_) => {
                debug!(device = %self.identifier, "poll timed out");
                Err(ConnectionError::ResponseTimeout)
            }
        };

        // Superseded polls must not unregister: the slot belongs to the
        // newer poll.
        let unregister = !matches!(outcome, Err(ConnectionError::Superseded));
        self.close(unregister).await;
        outcome
    }

    /// Resolves the parked waiter, if any. Returns whether a waiter was
    /// still there to resolve.
    fn resolve(&self, delivery: Delivery) -> bool {
        match self.delivery_tx.lock().take() {
            Some(tx) => tx.send(delivery).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Connection for HttpConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn serial(&self) -> u64 {
        self.serial
    }

    fn created_at(&self) -> Instant {
        self.created_at
    }

    fn last_active(&self) -> Instant {
        self.created_at
    }

    fn metadata(&self) -> &ConnectionMetadata {
        &self.metadata
    }

    /// Delivers a message payload to the parked poll waiter.
    async fn send(
        &self,
        msg: Message,
        expect_response: bool,
    ) -> Result<Option<Bytes>, ConnectionError> {
        if expect_response {
            // One-shot connections have no response path.
            return Err(ConnectionError::ClosedConnection);
        }
        if self.resolve(Ok(msg.payload)) {
            Ok(None)
        } else {
            Err(ConnectionError::ClosedConnection)
        }
    }

    async fn close(&self, unregister: bool) {
        if self
            .state
            .compare_exchange(RUNNING, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // A still-parked waiter observes the close.
            self.delivery_tx.lock().take();
            if unregister {
                if let Some(manager) = self.manager.upgrade() {
                    manager.unregister(&self.identifier, self.serial);
                }
            }
            self.done.cancel();
        }
        self.done.cancelled().await;
    }

    async fn close_displaced(&self) {
        self.resolve(Err(ConnectionError::Superseded));
        self.close(false).await;
    }

    async fn wait(&self) {
        self.done.cancelled().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
