//! Seams to the gateway's external collaborators.
//!
//! Channel persistence and search-index writing live outside the core; the
//! gateway reaches them through these traits only. Implementations are
//! injected at construction time — the core owns no global store, index
//! client, or configuration source.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::schema::Channel;

/// Read access to channel definitions.
///
/// Backed by whatever store persists channels (SQL, an in-memory map in
/// tests, a config file in small deployments). The gateway calls this on
/// every admission, so implementations are expected to cache.
#[async_trait]
pub trait ChannelResolver: Send + Sync {
    /// Looks up a channel by its integer id.
    async fn channel_by_id(&self, id: u64) -> Option<Arc<Channel>>;

    /// Lists all known channels.
    async fn channels(&self) -> Vec<Arc<Channel>>;
}

/// One indexable unit of telemetry, produced by the indexer handler from an
/// inbound device message filtered through its channel's schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryDocument {
    pub channel_id: u64,
    pub device_id: String,
    /// Gateway receive time, unix milliseconds.
    pub timestamp_ms: u64,
    /// Tag dimensions attached from connection metadata.
    pub tags: BTreeMap<String, String>,
    /// Schema-typed measurements extracted from the message payload.
    pub fields: BTreeMap<String, serde_json::Value>,
}

/// Destination for telemetry documents.
///
/// The concrete index client (and its batching, retry, and rotation policy)
/// is external; the gateway only hands documents over.
#[async_trait]
pub trait IndexSink: Send + Sync {
    /// Submits one document for indexing.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError`] when the sink rejects the document. The
    /// gateway logs and drops — telemetry indexing is best-effort.
    async fn index(&self, doc: TelemetryDocument) -> Result<(), IndexError>;
}

/// An index write rejected by the sink.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("telemetry index rejected document: {reason}")]
pub struct IndexError {
    pub reason: String,
}

impl IndexError {
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
