//! In-memory doubles for connection tests: a mock frame transport with a
//! scriptable peer, plus a stub connection for handler-chain tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use devicehub_core::{Channel, FieldType, Message};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::connection::{next_serial, Connection, ConnectionMetadata};
use super::error::{ConnectionError, TransportError};
use super::transport::{FrameReader, FrameWriter};

/// A frame observed on the write side of the mock transport.
#[derive(Debug)]
pub(crate) enum Written {
    Frame(Message),
    Close,
}

/// The far end of a mock transport: feed frames to the connection's reader,
/// observe what its writer puts on the wire, inject failures.
pub(crate) struct MockPeer {
    to_conn: Option<mpsc::UnboundedSender<Result<Message, TransportError>>>,
    from_conn: mpsc::UnboundedReceiver<Written>,
    fail_writes: Arc<AtomicBool>,
}

impl MockPeer {
    /// Delivers a frame to the connection's reader.
    pub fn send(&self, msg: Message) {
        if let Some(tx) = &self.to_conn {
            let _ = tx.send(Ok(msg));
        }
    }

    /// Delivers a read error to the connection's reader.
    pub fn fail(&self, err: TransportError) {
        if let Some(tx) = &self.to_conn {
            let _ = tx.send(Err(err));
        }
    }

    /// Closes the peer side; the reader observes a clean end of stream.
    pub fn close(&mut self) {
        self.to_conn = None;
    }

    /// Makes every subsequent write fail.
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Next frame the connection wrote, or `None` once its writer is gone.
    pub async fn written(&mut self) -> Option<Written> {
        self.from_conn.recv().await
    }
}

/// Builds a mock transport pair and the peer handle driving it.
pub(crate) fn mock_transport() -> (Box<dyn FrameReader>, Box<dyn FrameWriter>, MockPeer) {
    let (to_conn, reader_rx) = mpsc::unbounded_channel();
    let (writer_tx, from_conn) = mpsc::unbounded_channel();
    let fail_writes = Arc::new(AtomicBool::new(false));

    let reader = MockReader { rx: reader_rx };
    let writer = MockWriter {
        tx: writer_tx,
        fail_writes: Arc::clone(&fail_writes),
    };
    let peer = MockPeer {
        to_conn: Some(to_conn),
        from_conn,
        fail_writes,
    };
    (Box::new(reader), Box::new(writer), peer)
}

struct MockReader {
    rx: mpsc::UnboundedReceiver<Result<Message, TransportError>>,
}

#[async_trait]
impl FrameReader for MockReader {
    async fn next_frame(&mut self) -> Result<Option<Message>, TransportError> {
        match self.rx.recv().await {
            None => Ok(None),
            Some(Ok(msg)) => Ok(Some(msg)),
            Some(Err(e)) => Err(e),
        }
    }
}

struct MockWriter {
    tx: mpsc::UnboundedSender<Written>,
    fail_writes: Arc<AtomicBool>,
}

#[async_trait]
impl FrameWriter for MockWriter {
    async fn send_frame(&mut self, msg: &Message) -> Result<(), TransportError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Websocket("injected write failure".to_string()));
        }
        self.tx
            .send(Written::Frame(msg.clone()))
            .map_err(|_| TransportError::Closed)
    }

    async fn send_close(&mut self) -> Result<(), TransportError> {
        // Best-effort by contract; a gone peer is not an error.
        let _ = self.tx.send(Written::Close);
        Ok(())
    }
}

/// A valid channel for test metadata.
pub(crate) fn test_channel() -> Arc<Channel> {
    Arc::new(Channel {
        id: 1,
        name: "sensors".to_string(),
        description: "Test sensors".to_string(),
        tags: vec!["site".to_string()],
        fields: BTreeMap::from([
            ("temperature".to_string(), FieldType::Float),
            ("count".to_string(), FieldType::Int),
            ("online".to_string(), FieldType::Boolean),
            ("mode".to_string(), FieldType::String),
        ]),
        message_handlers: vec![],
        access_tokens: vec!["token-1".to_string()],
    })
}

pub(crate) fn test_metadata() -> ConnectionMetadata {
    ConnectionMetadata::new(test_channel())
}

/// A minimal registered-looking connection for pipeline tests.
pub(crate) fn stub_connection(identifier: &str) -> Arc<dyn Connection> {
    Arc::new(StubConnection {
        identifier: identifier.to_string(),
        serial: next_serial(),
        created_at: Instant::now(),
        metadata: test_metadata(),
        done: CancellationToken::new(),
    })
}

struct StubConnection {
    identifier: String,
    serial: u64,
    created_at: Instant,
    metadata: ConnectionMetadata,
    done: CancellationToken,
}

#[async_trait]
impl Connection for StubConnection {
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

    async fn send(
        &self,
        _msg: Message,
        _expect_response: bool,
    ) -> Result<Option<Bytes>, ConnectionError> {
        Ok(None)
    }

    async fn close(&self, _unregister: bool) {
        self.done.cancel();
    }

    async fn close_displaced(&self) {
        self.done.cancel();
    }

    async fn wait(&self) {
        self.done.cancelled().await;
    }
}
