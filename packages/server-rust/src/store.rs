//! In-memory channel store.
//!
//! Implements [`ChannelResolver`] over a concurrent map and drives the
//! channel lifecycle side effects: creating a channel validates its schema
//! and creates its connection manager; deleting it closes the manager and
//! every connection under it. Deployments with durable channel definitions
//! swap in their own resolver and keep the same lifecycle calls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use devicehub_core::{Channel, ChannelHash, ChannelResolver, ValidationError};
use tracing::info;

use crate::connections::{ChannelRegistry, RegistryError};

/// Channel lifecycle failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("channel {id} not found")]
    NotFound { id: u64 },

    #[error("channel name already taken: {name}")]
    DuplicateName { name: String },
}

/// DashMap-backed channel store with autoincrement ids.
pub struct MemoryChannelStore {
    channels: DashMap<u64, Arc<Channel>>,
    next_id: AtomicU64,
    registry: Arc<ChannelRegistry>,
    hash_codec: Arc<ChannelHash>,
}

impl MemoryChannelStore {
    #[must_use]
    pub fn new(registry: Arc<ChannelRegistry>, hash_codec: Arc<ChannelHash>) -> Self {
        Self {
            channels: DashMap::new(),
            next_id: AtomicU64::new(1),
            registry,
            hash_codec,
        }
    }

    /// Creates a channel: validates the schema, assigns the next id, and
    /// creates the channel's connection manager.
    ///
    /// # Errors
    ///
    /// Validation failures, duplicate names, or a manager collision.
    pub fn create(&self, mut channel: Channel) -> Result<Arc<Channel>, StoreError> {
        channel.validate()?;
        if self.name_taken(&channel.name, None) {
            return Err(StoreError::DuplicateName { name: channel.name });
        }

        channel.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let hash = self.hash_codec.encode(channel.id);
        self.registry.create_manager(&hash)?;

        let channel = Arc::new(channel);
        self.channels.insert(channel.id, Arc::clone(&channel));
        info!(channel = channel.id, name = %channel.name, "channel created");
        Ok(channel)
    }

    /// Replaces a channel definition after update validation (tags and
    /// fields may grow but never shrink or change type).
    ///
    /// # Errors
    ///
    /// Unknown id, validation failures, or a name collision.
    pub fn update(&self, channel: Channel) -> Result<Arc<Channel>, StoreError> {
        let prev = self
            .channels
            .get(&channel.id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(StoreError::NotFound { id: channel.id })?;

        channel.validate_update(&prev)?;
        if self.name_taken(&channel.name, Some(channel.id)) {
            return Err(StoreError::DuplicateName { name: channel.name });
        }

        let channel = Arc::new(channel);
        self.channels.insert(channel.id, Arc::clone(&channel));
        Ok(channel)
    }

    /// Deletes a channel and closes its connection manager, driving every
    /// connection under it to terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown id.
    pub async fn delete(&self, id: u64) -> Result<(), StoreError> {
        let (_, channel) = self
            .channels
            .remove(&id)
            .ok_or(StoreError::NotFound { id })?;

        let hash = self.hash_codec.encode(id);
        // The manager may already be gone if the registry was drained.
        let _ = self.registry.close_manager(&hash).await;
        info!(channel = id, name = %channel.name, "channel deleted");
        Ok(())
    }

    fn name_taken(&self, name: &str, excluding: Option<u64>) -> bool {
        self.channels
            .iter()
            .any(|entry| entry.value().name == name && Some(entry.value().id) != excluding)
    }
}

#[async_trait]
impl ChannelResolver for MemoryChannelStore {
    async fn channel_by_id(&self, id: u64) -> Option<Arc<Channel>> {
        self.channels.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    async fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
