//! The WebSocket connection state machine.
//!
//! Each connection owns two long-running tasks. The reader pumps inbound
//! frames under a per-read idle deadline: requests and notifications go
//! through the handler chain inline (handler latency back-pressures the
//! reader), responses resolve the pending map by id, pings refresh the idle
//! deadline and answer with a clock pong. The writer drains the bounded
//! write-request queue, installing the pending entry for a request *before*
//! flushing it so a fast peer cannot respond before the entry exists.
//!
//! Every termination reason — peer close, I/O error, idle deadline, manager
//! shutdown, displacement — converges on one close path: CAS into Closing,
//! cancel the close token, let both pumps exit (the writer says goodbye with
//! a close frame bounded by the write timeout), then a supervisor drains the
//! pending map, unregisters if asked, and trips the done token that `wait`
//! and `close` callers park on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use devicehub_core::{Message, MessageKind};
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::connection::{next_serial, Connection, ConnectionMetadata};
use super::error::ConnectionError;
use super::manager::ConnectionManager;
use super::transport::{FrameReader, FrameWriter};
use crate::metrics::{CONNECTIONS_CLOSED, SEND_TIMEOUTS};
use crate::network::config::WsConfig;
use crate::pipeline::Handler;

const RUNNING: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Current unix time in milliseconds.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// One entry on the writer queue.
struct WriteRequest {
    msg: Message,
    /// Present when the sender awaits a response; the writer installs it
    /// into the pending map keyed by the message id before flushing.
    respond_to: Option<oneshot::Sender<Bytes>>,
}

impl std::fmt::Debug for WebsocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebsocketConnection")
            .field("identifier", &self.identifier)
            .field("serial", &self.serial)
            .finish_non_exhaustive()
    }
}

/// A long-lived device connection over a frame transport.
pub struct WebsocketConnection {
    identifier: String,
    serial: u64,
    created_at: Instant,
    metadata: ConnectionMetadata,
    handler: Handler,
    manager: Weak<ConnectionManager>,
    config: WsConfig,

    state: AtomicU64,
    unregister_on_close: AtomicBool,
    /// Milliseconds since `created_at` of the last inbound frame.
    last_active_offset_ms: AtomicU64,
    /// Unix millis of the last inbound ping; 0 means never pinged.
    last_pinged_at_ms: AtomicU64,

    write_tx: mpsc::Sender<WriteRequest>,
    pending: Mutex<HashMap<Bytes, oneshot::Sender<Bytes>>>,
    next_request_id: AtomicU64,

    close_token: CancellationToken,
    done: CancellationToken,

    /// Transport halves parked here between construction and `start` (or
    /// `discard`, when admission fails after construction).
    reader_half: Mutex<Option<Box<dyn FrameReader>>>,
    writer_parts: Mutex<Option<(mpsc::Receiver<WriteRequest>, Box<dyn FrameWriter>)>>,
}

impl WebsocketConnection {
    pub(crate) fn new(
        identifier: String,
        reader: Box<dyn FrameReader>,
        writer: Box<dyn FrameWriter>,
        handler: Handler,
        metadata: ConnectionMetadata,
        config: WsConfig,
        manager: Weak<ConnectionManager>,
    ) -> Arc<Self> {
        let (write_tx, write_rx) = mpsc::channel(config.request_queue_size.max(1));
        Arc::new(Self {
            identifier,
            serial: next_serial(),
            created_at: Instant::now(),
            metadata,
            handler,
            manager,
            config,
            state: AtomicU64::new(u64::from(RUNNING)),
            unregister_on_close: AtomicBool::new(true),
            last_active_offset_ms: AtomicU64::new(0),
            last_pinged_at_ms: AtomicU64::new(0),
            write_tx,
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            close_token: CancellationToken::new(),
            done: CancellationToken::new(),
            reader_half: Mutex::new(Some(reader)),
            writer_parts: Mutex::new(Some((write_rx, writer))),
        })
    }

    /// Launches the reader, writer, and close supervisor tasks. Called once
    /// by the manager after the connection is registered.
    pub(crate) fn start(self: Arc<Self>) {
        let reader = self
            .reader_half
            .lock()
            .take()
            .expect("start() called twice");
        let (write_rx, writer) = self
            .writer_parts
            .lock()
            .take()
            .expect("start() called twice");

        let read_task = tokio::spawn(Self::read_loop(Arc::clone(&self), reader));
        let write_task = tokio::spawn(Self::write_loop(Arc::clone(&self), write_rx, writer));
        tokio::spawn(Self::supervise(self, read_task, write_task));
    }

    /// Tears down a connection that was fully built but never admitted
    /// (manager closed between construction and registration): best-effort
    /// close frame bounded by the write timeout, then drop the transport.
    pub(crate) async fn discard(&self) {
        let parts = self.writer_parts.lock().take();
        if let Some((_rx, mut writer)) = parts {
            let _ = tokio::time::timeout(self.config.timeouts.write, writer.send_close()).await;
        }
        self.reader_half.lock().take();
        self.state.store(u64::from(CLOSED), Ordering::Release);
        self.close_token.cancel();
        self.done.cancel();
    }

    /// Unix millis of the last inbound ping, if the peer ever pinged.
    #[must_use]
    pub fn last_pinged_at_ms(&self) -> Option<u64> {
        match self.last_pinged_at_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(ms),
        }
    }

    /// Whether the connection has reached terminal state.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == u64::from(CLOSED)
    }

    fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == u64::from(RUNNING)
    }

    /// Allocates a request id unique on this connection.
    fn next_id(&self) -> Bytes {
        Bytes::from(
            self.next_request_id
                .fetch_add(1, Ordering::Relaxed)
                .to_string(),
        )
    }

    fn touch(&self) {
        let offset = u64::try_from(self.created_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_active_offset_ms.store(offset, Ordering::Release);
    }

    /// Initiates the close transition without waiting for completion. Used
    /// internally by the pump tasks, which cannot await their own teardown.
    fn begin_close(&self, unregister: bool) {
        if self
            .state
            .compare_exchange(
                u64::from(RUNNING),
                u64::from(CLOSING),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.unregister_on_close.store(unregister, Ordering::Release);
            self.close_token.cancel();
        }
    }

    /// Sends a message, optionally waiting for the matching response.
    ///
    /// Enqueueing blocks up to the `request` timeout when the write queue is
    /// full (a zero timeout fails immediately); the response is awaited up
    /// to the `response` timeout. A timed-out request's pending entry is
    /// removed, so a late response is dropped silently by the reader.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::ClosedConnection`], [`ConnectionError::RequestTimeout`],
    /// or [`ConnectionError::ResponseTimeout`].
    pub async fn send(
        &self,
        mut msg: Message,
        expect_response: bool,
    ) -> Result<Option<Bytes>, ConnectionError> {
        if !self.is_running() {
            return Err(ConnectionError::ClosedConnection);
        }

        let mut response_rx = None;
        let mut request_id = None;
        if expect_response {
            msg.id = self.next_id();
            request_id = Some(msg.id.clone());
            let (tx, rx) = oneshot::channel();
            response_rx = Some(rx);
            // The writer installs tx into the pending map right before the
            // frame is flushed; registration must not happen here or a
            // request stuck in the queue would look in-flight.
            let req = WriteRequest {
                msg,
                respond_to: Some(tx),
            };
            self.enqueue(req).await?;
        } else {
            self.enqueue(WriteRequest {
                msg,
                respond_to: None,
            })
            .await?;
        }

        let Some(rx) = response_rx else {
            return Ok(None);
        };
        let id = request_id.unwrap_or_default();

        match tokio::time::timeout(self.config.timeouts.response, rx).await {
            Ok(Ok(payload)) => Ok(Some(payload)),
            Ok(Err(_)) => Err(ConnectionError::ClosedConnection),
            Err(_) => {
                self.pending.lock().remove(&id);
                counter!(SEND_TIMEOUTS).increment(1);
                Err(ConnectionError::ResponseTimeout)
            }
        }
    }

    /// Non-blocking enqueue of a fire-and-forget message.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::QueueFull`] when the write queue is at capacity,
    /// [`ConnectionError::ClosedConnection`] when the connection is closed.
    pub fn try_send(&self, msg: Message) -> Result<(), ConnectionError> {
        if !self.is_running() {
            return Err(ConnectionError::ClosedConnection);
        }
        self.write_tx
            .try_send(WriteRequest {
                msg,
                respond_to: None,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ConnectionError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => ConnectionError::ClosedConnection,
            })
    }

    async fn enqueue(&self, req: WriteRequest) -> Result<(), ConnectionError> {
        match tokio::time::timeout(self.config.timeouts.request, self.write_tx.send(req)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ConnectionError::ClosedConnection),
            Err(_) => Err(ConnectionError::RequestTimeout),
        }
    }

    // -----------------------------------------------------------------------
    // Pump tasks
    // -----------------------------------------------------------------------

    async fn read_loop(conn: Arc<Self>, mut reader: Box<dyn FrameReader>) {
        loop {
            let outcome = tokio::select! {
                biased;
                () = conn.close_token.cancelled() => break,
                outcome = tokio::time::timeout(conn.config.timeouts.read, reader.next_frame()) => outcome,
            };

            match outcome {
                Err(_) => {
                    debug!(device = %conn.identifier, "idle deadline expired, closing");
                    conn.begin_close(true);
                    break;
                }
                Ok(Ok(None)) => {
                    debug!(device = %conn.identifier, "peer closed the transport");
                    conn.begin_close(true);
                    break;
                }
                Ok(Err(e)) => {
                    warn!(device = %conn.identifier, error = %e, "read failed, closing");
                    conn.begin_close(true);
                    break;
                }
                Ok(Ok(Some(msg))) => {
                    conn.touch();
                    Self::dispatch(&conn, msg).await;
                }
            }
        }
    }

    async fn dispatch(conn: &Arc<Self>, msg: Message) {
        match msg.kind {
            MessageKind::Ping => {
                // The idle deadline extension falls out of the read loop
                // re-arming its timeout after every frame, pings included.
                conn.last_pinged_at_ms
                    .store(unix_millis().max(1), Ordering::Release);
                let pong = Message::pong(Bytes::from(unix_millis().to_string()));
                if let Err(e) = conn.try_send(pong) {
                    debug!(device = %conn.identifier, error = %e, "pong dropped");
                }
            }
            MessageKind::Pong => {
                debug!(device = %conn.identifier, "pong received");
            }
            MessageKind::Request | MessageKind::Notification => {
                let as_dyn: Arc<dyn Connection> = Arc::clone(conn) as Arc<dyn Connection>;
                (conn.handler)(as_dyn, msg).await;
            }
            MessageKind::Response => {
                let waiter = conn.pending.lock().remove(&msg.id);
                match waiter {
                    Some(tx) => {
                        // A send() that timed out a moment ago dropped its
                        // receiver; that race loses quietly.
                        let _ = tx.send(msg.payload);
                    }
                    None => {
                        debug!(device = %conn.identifier, "late response dropped");
                    }
                }
            }
        }
    }

    async fn write_loop(
        conn: Arc<Self>,
        mut write_rx: mpsc::Receiver<WriteRequest>,
        mut writer: Box<dyn FrameWriter>,
    ) {
        loop {
            let req = tokio::select! {
                biased;
                () = conn.close_token.cancelled() => break,
                req = write_rx.recv() => match req {
                    Some(req) => req,
                    None => break,
                },
            };

            if let Some(tx) = req.respond_to {
                // Install before flushing: a fast peer must find the entry.
                conn.pending.lock().insert(req.msg.id.clone(), tx);
            }

            match tokio::time::timeout(conn.config.timeouts.write, writer.send_frame(&req.msg))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(device = %conn.identifier, error = %e, "write failed, closing");
                    conn.begin_close(true);
                    break;
                }
                Err(_) => {
                    warn!(device = %conn.identifier, "write deadline expired, closing");
                    conn.begin_close(true);
                    break;
                }
            }
        }

        // Farewell close frame, best-effort and bounded by the write timeout.
        let _ = tokio::time::timeout(conn.config.timeouts.write, writer.send_close()).await;
    }

    /// Completes the close once both pumps have exited: drains the pending
    /// map (waiters observe `ClosedConnection`), unregisters when asked, and
    /// trips the done token.
    async fn supervise(conn: Arc<Self>, read_task: JoinHandle<()>, write_task: JoinHandle<()>) {
        let _ = read_task.await;
        let _ = write_task.await;

        conn.pending.lock().clear();

        if conn.unregister_on_close.load(Ordering::Acquire) {
            if let Some(manager) = conn.manager.upgrade() {
                manager.unregister(&conn.identifier, conn.serial);
            }
        }

        conn.state.store(u64::from(CLOSED), Ordering::Release);
        counter!(CONNECTIONS_CLOSED).increment(1);
        debug!(device = %conn.identifier, "connection closed");
        conn.done.cancel();
    }
}

#[async_trait]
impl Connection for WebsocketConnection {
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
            + Duration::from_millis(self.last_active_offset_ms.load(Ordering::Acquire))
    }

    fn metadata(&self) -> &ConnectionMetadata {
        &self.metadata
    }

    async fn send(
        &self,
        msg: Message,
        expect_response: bool,
    ) -> Result<Option<Bytes>, ConnectionError> {
        self.send(msg, expect_response).await
    }

    async fn close(&self, unregister: bool) {
        self.begin_close(unregister);
        self.done.cancelled().await;
    }

    async fn close_displaced(&self) {
        self.close(false).await;
    }

    async fn wait(&self) {
        self.done.cancelled().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
