//! The process-wide channel registry.
//!
//! Maps channel hash-ids to their connection managers. Sharded into a fixed
//! number of buckets to keep admission-time lookups from contending with
//! channel lifecycle changes: lookups take a shard's read lock, structural
//! changes its write lock, and manager shutdown always runs outside every
//! registry lock.

use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::task::JoinSet;
use tracing::info;

use super::manager::ConnectionManager;
use crate::network::config::SharedConfig;

/// Registry lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("a connection manager already exists for channel {hash_id}")]
    AlreadyExists { hash_id: String },

    #[error("no connection manager for channel {hash_id}")]
    NotFound { hash_id: String },
}

type Shard = RwLock<HashMap<String, Arc<ConnectionManager>>>;

/// Sharded hash-id → [`ConnectionManager`] map.
pub struct ChannelRegistry {
    shards: Vec<Shard>,
    hasher: ahash::RandomState,
    config: Arc<SharedConfig>,
}

impl ChannelRegistry {
    /// Builds the registry with the configured shard count and per-shard
    /// capacity hint. Shard count and capacity are fixed for the registry's
    /// lifetime; later config swaps affect connections, not the shard
    /// layout.
    #[must_use]
    pub fn new(config: Arc<SharedConfig>) -> Self {
        let snapshot = config.load();
        let nshards = snapshot.connections.nshards.max(1);
        let shards = (0..nshards)
            .map(|_| RwLock::new(HashMap::with_capacity(snapshot.connections.init_shard_size)))
            .collect();
        Self {
            shards,
            hasher: ahash::RandomState::new(),
            config,
        }
    }

    fn shard(&self, hash_id: &str) -> &Shard {
        let h = self.hasher.hash_one(hash_id);
        let index = usize::try_from(h).unwrap_or(usize::MAX) % self.shards.len();
        &self.shards[index]
    }

    /// Creates the manager for a channel.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyExists`] if the channel already has
    /// one — at most one manager per hash-id exists at any instant.
    pub fn create_manager(&self, hash_id: &str) -> Result<Arc<ConnectionManager>, RegistryError> {
        let mut shard = self.shard(hash_id).write();
        if shard.contains_key(hash_id) {
            return Err(RegistryError::AlreadyExists {
                hash_id: hash_id.to_string(),
            });
        }
        let manager = ConnectionManager::new(hash_id.to_string(), Arc::clone(&self.config));
        shard.insert(hash_id.to_string(), Arc::clone(&manager));
        Ok(manager)
    }

    /// Removes a channel's manager and drives it to closed, returning only
    /// once every connection it held is terminal. The removal is atomic;
    /// the shutdown runs outside the registry lock.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown hash-id.
    pub async fn close_manager(&self, hash_id: &str) -> Result<(), RegistryError> {
        let manager = self
            .shard(hash_id)
            .write()
            .remove(hash_id)
            .ok_or_else(|| RegistryError::NotFound {
                hash_id: hash_id.to_string(),
            })?;
        manager.close().await;
        Ok(())
    }

    /// Looks up a channel's manager.
    #[must_use]
    pub fn lookup(&self, hash_id: &str) -> Option<Arc<ConnectionManager>> {
        self.shard(hash_id).read().get(hash_id).cloned()
    }

    /// Number of managers across all shards.
    #[must_use]
    pub fn count(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    /// Number of registered device connections across all managers.
    #[must_use]
    pub fn total_connections(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().values().map(|m| m.count()).sum::<usize>())
            .sum()
    }

    /// Removes and closes every manager. Used by gateway drain.
    pub async fn close_all(&self) {
        let managers: Vec<Arc<ConnectionManager>> = self
            .shards
            .iter()
            .flat_map(|s| s.write().drain().map(|(_, m)| m).collect::<Vec<_>>())
            .collect();

        if managers.is_empty() {
            return;
        }
        info!(count = managers.len(), "closing all connection managers");

        let mut closers = JoinSet::new();
        for manager in managers {
            closers.spawn(async move { manager.close().await });
        }
        while closers.join_next().await.is_some() {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::super::testing::{mock_transport, test_metadata};
    use super::*;
    use crate::network::config::{ConnectionsConfig, GatewayConfig};
    use crate::pipeline::noop_handler;

    fn registry_with_shards(nshards: usize) -> ChannelRegistry {
        ChannelRegistry::new(Arc::new(SharedConfig::new(GatewayConfig {
            connections: ConnectionsConfig {
                nshards,
                init_shard_size: 4,
            },
            ..GatewayConfig::default()
        })))
    }

    #[test]
    fn create_lookup_and_count() {
        let registry = registry_with_shards(4);
        assert_eq!(registry.count(), 0);

        let manager = registry.create_manager("hash-a").unwrap();
        assert_eq!(manager.hash_id(), "hash-a");
        assert_eq!(registry.count(), 1);

        let found = registry.lookup("hash-a").expect("created");
        assert!(Arc::ptr_eq(&found, &manager));
        assert!(registry.lookup("hash-b").is_none());
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let registry = registry_with_shards(4);
        registry.create_manager("hash-a").unwrap();
        let err = registry.create_manager("hash-a").unwrap_err();
        assert_eq!(
            err,
            RegistryError::AlreadyExists {
                hash_id: "hash-a".to_string()
            }
        );
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn close_manager_removes_and_closes() {
        let registry = registry_with_shards(4);
        let manager = registry.create_manager("hash-a").unwrap();

        registry.close_manager("hash-a").await.unwrap();
        assert!(registry.lookup("hash-a").is_none());
        assert!(manager.is_closed());

        // Subsequent admission through a stale handle fails.
        let (reader, writer, _peer) = mock_transport();
        let err = manager
            .new_websocket_connection(
                "d1".to_string(),
                reader,
                writer,
                noop_handler(),
                test_metadata(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            super::super::error::ConnectionError::ClosedManager
        ));
    }

    #[tokio::test]
    async fn close_unknown_manager_is_not_found() {
        let registry = registry_with_shards(4);
        let err = registry.close_manager("nope").await.unwrap_err();
        assert_eq!(
            err,
            RegistryError::NotFound {
                hash_id: "nope".to_string()
            }
        );
    }

    #[test]
    fn single_shard_still_works() {
        let registry = registry_with_shards(1);
        for i in 0..16 {
            registry.create_manager(&format!("hash-{i}")).unwrap();
        }
        assert_eq!(registry.count(), 16);
        for i in 0..16 {
            assert!(registry.lookup(&format!("hash-{i}")).is_some());
        }
    }

    #[test]
    fn many_managers_spread_across_shards() {
        let registry = registry_with_shards(8);
        for i in 0..64 {
            registry.create_manager(&format!("hash-{i}")).unwrap();
        }
        assert_eq!(registry.count(), 64);
        // Every manager remains reachable regardless of which shard holds it.
        for i in 0..64 {
            assert!(registry.lookup(&format!("hash-{i}")).is_some());
        }
        // With 64 keys over 8 shards, at least two shards must be non-empty
        // unless the hash is degenerate.
        let populated = registry.shards.iter().filter(|s| !s.read().is_empty()).count();
        assert!(populated >= 2, "hash unexpectedly degenerate");
    }

    #[tokio::test]
    async fn close_all_closes_everything() {
        let registry = registry_with_shards(4);
        let managers: Vec<_> = (0..8)
            .map(|i| registry.create_manager(&format!("hash-{i}")).unwrap())
            .collect();

        registry.close_all().await;
        assert_eq!(registry.count(), 0);
        for manager in managers {
            assert!(manager.is_closed());
        }
    }

    proptest::proptest! {
        #[test]
        fn every_created_manager_stays_reachable(
            hash_ids in proptest::collection::hash_set("[A-Za-z0-9]{1,24}", 1..32),
        ) {
            let registry = registry_with_shards(8);
            for hash_id in &hash_ids {
                registry.create_manager(hash_id).unwrap();
            }
            for hash_id in &hash_ids {
                proptest::prop_assert!(registry.lookup(hash_id).is_some());
            }
            proptest::prop_assert_eq!(registry.count(), hash_ids.len());
        }
    }

    #[tokio::test]
    async fn total_connections_sums_managers() {
        let registry = registry_with_shards(4);
        let manager = registry.create_manager("hash-a").unwrap();
        registry.create_manager("hash-b").unwrap();
        assert_eq!(registry.total_connections(), 0);

        let (reader, writer, peer) = mock_transport();
        std::mem::forget(peer);
        let _conn = manager
            .new_websocket_connection(
                "d1".to_string(),
                reader,
                writer,
                noop_handler(),
                test_metadata(),
            )
            .await
            .unwrap();
        assert_eq!(registry.total_connections(), 1);

        registry.close_all().await;
        assert_eq!(registry.total_connections(), 0);
    }
}
