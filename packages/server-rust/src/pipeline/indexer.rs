//! Telemetry indexing middleware.
//!
//! Converts inbound `Request` and `Notification` payloads into
//! [`TelemetryDocument`]s filtered through the channel schema — unknown
//! keys are dropped, known fields are kept only when the JSON value matches
//! the declared type, tag values come from the payload and from connection
//! metadata — and hands them to the injected [`IndexSink`]. Indexing is
//! best-effort: sink failures are logged and the chain continues.

use std::collections::BTreeMap;
use std::sync::Arc;

use devicehub_core::{FieldType, IndexSink, Message, MessageKind, TelemetryDocument};
use metrics::counter;
use tracing::{debug, warn};

use super::{Handler, Middleware};
use crate::connections::Connection;
use crate::connections::websocket::unix_millis;
use crate::metrics::DOCUMENTS_INDEXED;

/// Builds schema-filtered documents and forwards them to the sink.
pub struct IndexerMiddleware {
    sink: Arc<dyn IndexSink>,
}

impl IndexerMiddleware {
    #[must_use]
    pub fn new(sink: Arc<dyn IndexSink>) -> Self {
        Self { sink }
    }
}

impl Middleware for IndexerMiddleware {
    fn wrap(&self, next: Handler) -> Handler {
        let sink = Arc::clone(&self.sink);
        Arc::new(move |conn, msg| {
            let sink = Arc::clone(&sink);
            let next = Arc::clone(&next);
            Box::pin(async move {
                if matches!(msg.kind, MessageKind::Request | MessageKind::Notification) {
                    if let Some(doc) = build_document(conn.as_ref(), &msg) {
                        match sink.index(doc).await {
                            Ok(()) => counter!(DOCUMENTS_INDEXED).increment(1),
                            Err(e) => {
                                warn!(device = %conn.identifier(), error = %e, "index write failed");
                            }
                        }
                    }
                }
                next(conn, msg).await;
            })
        })
    }
}

/// Filters a message payload through its channel schema.
///
/// Returns `None` for payloads that are not JSON objects or that carry no
/// schema field at all.
fn build_document(conn: &dyn Connection, msg: &Message) -> Option<TelemetryDocument> {
    let channel = &conn.metadata().channel;

    let parsed: serde_json::Value = match serde_json::from_slice(&msg.payload) {
        Ok(value) => value,
        Err(e) => {
            debug!(device = %conn.identifier(), error = %e, "payload is not JSON, skipping index");
            return None;
        }
    };
    let serde_json::Value::Object(object) = parsed else {
        debug!(device = %conn.identifier(), "payload is not an object, skipping index");
        return None;
    };

    let mut fields = BTreeMap::new();
    let mut tags = BTreeMap::new();

    for (key, value) in object {
        if let Some(field_type) = channel.fields.get(&key) {
            if value_matches(*field_type, &value) {
                fields.insert(key, value);
            } else {
                debug!(device = %conn.identifier(), field = %key, "type mismatch, field dropped");
            }
        } else if channel.tags.contains(&key) {
            if let serde_json::Value::String(s) = value {
                tags.insert(key, s);
            }
        }
    }

    if fields.is_empty() {
        return None;
    }

    // Metadata attributes matching channel tags (e.g. values captured at
    // admission) round out the document; payload values win on conflict.
    for tag in &channel.tags {
        if !tags.contains_key(tag) {
            if let Some(value) = conn.metadata().attributes.get(tag) {
                tags.insert(tag.clone(), value.clone());
            }
        }
    }

    Some(TelemetryDocument {
        channel_id: channel.id,
        device_id: conn.identifier().to_string(),
        timestamp_ms: unix_millis(),
        tags,
        fields,
    })
}

fn value_matches(field_type: FieldType, value: &serde_json::Value) -> bool {
    match field_type {
        FieldType::Float => value.is_number(),
        FieldType::Int => value.is_i64() || value.is_u64(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::String => value.is_string(),
    }
}

/// A sink that drops documents on the floor, logging at debug. The daemon
/// default until a real index client is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullIndexSink;

#[async_trait::async_trait]
impl IndexSink for NullIndexSink {
    async fn index(&self, doc: TelemetryDocument) -> Result<(), devicehub_core::IndexError> {
        debug!(
            channel = doc.channel_id,
            device = %doc.device_id,
            fields = doc.fields.len(),
            "document discarded (null sink)"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use devicehub_core::IndexError;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::connections::testing::stub_connection;
    use crate::pipeline::MiddlewareStack;

    #[derive(Default)]
    struct RecordingSink {
        docs: Mutex<Vec<TelemetryDocument>>,
    }

    #[async_trait::async_trait]
    impl IndexSink for RecordingSink {
        async fn index(&self, doc: TelemetryDocument) -> Result<(), IndexError> {
            self.docs.lock().push(doc);
            Ok(())
        }
    }

    fn indexing_handler(sink: Arc<RecordingSink>) -> Handler {
        let mut stack = MiddlewareStack::new();
        stack.push(Arc::new(IndexerMiddleware::new(sink)));
        stack.chain()
    }

    // The stub connection's channel declares: temperature (float),
    // count (int), online (boolean), mode (string), and tag "site".

    #[tokio::test]
    async fn schema_fields_are_extracted() {
        let sink = Arc::new(RecordingSink::default());
        let handler = indexing_handler(Arc::clone(&sink));

        let payload = json!({
            "temperature": 21.5,
            "count": 3,
            "online": true,
            "mode": "eco",
            "site": "hq",
            "unknown_key": "dropped",
        });
        handler(
            stub_connection("d1"),
            Message::notification(&b"1"[..], serde_json::to_vec(&payload).unwrap()),
        )
        .await;

        let docs = sink.docs.lock();
        assert_eq!(docs.len(), 1);
        let doc = &docs[0];
        assert_eq!(doc.device_id, "d1");
        assert_eq!(doc.channel_id, 1);
        assert!(doc.timestamp_ms > 0);
        assert_eq!(doc.fields.len(), 4);
        assert_eq!(doc.fields["temperature"], json!(21.5));
        assert_eq!(doc.tags["site"], "hq");
        assert!(!doc.fields.contains_key("unknown_key"));
    }

    #[tokio::test]
    async fn mistyped_fields_are_dropped() {
        let sink = Arc::new(RecordingSink::default());
        let handler = indexing_handler(Arc::clone(&sink));

        let payload = json!({
            "temperature": "not-a-number",
            "online": true,
        });
        handler(
            stub_connection("d1"),
            Message::notification(&b"1"[..], serde_json::to_vec(&payload).unwrap()),
        )
        .await;

        let docs = sink.docs.lock();
        assert_eq!(docs.len(), 1);
        assert!(!docs[0].fields.contains_key("temperature"));
        assert!(docs[0].fields.contains_key("online"));
    }

    #[tokio::test]
    async fn non_json_and_fieldless_payloads_are_skipped() {
        let sink = Arc::new(RecordingSink::default());
        let handler = indexing_handler(Arc::clone(&sink));

        handler(
            stub_connection("d1"),
            Message::notification(&b"1"[..], &b"not json"[..]),
        )
        .await;
        handler(
            stub_connection("d1"),
            Message::notification(
                &b"2"[..],
                serde_json::to_vec(&json!({"site": "hq"})).unwrap(),
            ),
        )
        .await;

        assert!(sink.docs.lock().is_empty());
    }

    #[tokio::test]
    async fn responses_are_not_indexed() {
        let sink = Arc::new(RecordingSink::default());
        let handler = indexing_handler(Arc::clone(&sink));

        handler(
            stub_connection("d1"),
            Message::response(
                &b"1"[..],
                serde_json::to_vec(&json!({"online": true})).unwrap(),
            ),
        )
        .await;
        assert!(sink.docs.lock().is_empty());
    }
}
