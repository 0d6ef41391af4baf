//! Gateway configuration types.
//!
//! All values are injected by the application; the core reads them at
//! connection-construction time. Hot reload publishes a fresh snapshot
//! through [`SharedConfig`] — readers never block, and live connections
//! keep the values they were built with.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bind address for the device-facing server.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,
    /// Maximum time to wait for a plain HTTP request to complete.
    pub request_timeout: Duration,
    /// Channel registry sharding.
    pub connections: ConnectionsConfig,
    /// Per-WebSocket-connection settings.
    pub websocket: WsConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            tls: None,
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
            connections: ConnectionsConfig::default(),
            websocket: WsConfig::default(),
        }
    }
}

/// TLS certificate configuration.
///
/// No `Default` impl because certificate paths have no sensible defaults.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to the TLS certificate file.
    pub cert_path: PathBuf,
    /// Path to the TLS private key file.
    pub key_path: PathBuf,
}

/// Channel registry sharding configuration.
#[derive(Debug, Clone)]
pub struct ConnectionsConfig {
    /// Number of registry shards. A power of two spreads the hash best,
    /// but any positive count works.
    pub nshards: usize,
    /// Initial per-shard map capacity (a hint, not a limit).
    pub init_shard_size: usize,
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        Self {
            nshards: 8,
            init_shard_size: 64,
        }
    }
}

/// Per-connection WebSocket settings, snapshotted at admission.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Bounded write-request queue capacity per connection.
    pub request_queue_size: usize,
    /// Protocol timeouts.
    pub timeouts: WsTimeouts,
    /// Transport buffer sizes.
    pub buffer_sizes: WsBufferSizes,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            request_queue_size: 256,
            timeouts: WsTimeouts::default(),
            buffer_sizes: WsBufferSizes::default(),
        }
    }
}

/// The four timeouts governing a device connection.
#[derive(Debug, Clone)]
pub struct WsTimeouts {
    /// Idle deadline: a connection with no inbound traffic for this long is
    /// closed. Extended by pings.
    pub read: Duration,
    /// Deadline for a single frame write (close and pong frames included).
    pub write: Duration,
    /// How long an enqueue may wait for space in the write queue.
    pub request: Duration,
    /// How long a request waits for its matching response.
    pub response: Duration,
}

impl Default for WsTimeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(60),
            write: Duration::from_secs(5),
            request: Duration::from_secs(2),
            response: Duration::from_secs(10),
        }
    }
}

/// Transport buffer sizes in bytes.
#[derive(Debug, Clone)]
pub struct WsBufferSizes {
    /// Bound on a single inbound message.
    pub read: usize,
    /// Outbound write buffer.
    pub write: usize,
}

impl Default for WsBufferSizes {
    fn default() -> Self {
        Self {
            read: 65_536,
            write: 131_072,
        }
    }
}

/// Lock-free configuration snapshot publication.
///
/// Readers call [`load`](Self::load) and get an immutable snapshot without
/// taking any lock; hot reload swaps in a whole new snapshot with
/// [`store`](Self::store). Connections admitted after a swap see the new
/// values; existing connections are untouched.
#[derive(Debug)]
pub struct SharedConfig {
    inner: ArcSwap<GatewayConfig>,
}

impl SharedConfig {
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            inner: ArcSwap::from_pointee(config),
        }
    }

    /// Returns the current snapshot.
    #[must_use]
    pub fn load(&self) -> Arc<GatewayConfig> {
        self.inner.load_full()
    }

    /// Publishes a new snapshot for subsequent readers.
    pub fn store(&self, config: GatewayConfig) {
        self.inner.store(Arc::new(config));
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(GatewayConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_config_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 0);
        assert!(config.tls.is_none());
        assert_eq!(config.cors_origins, vec!["*"]);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn ws_config_defaults() {
        let config = WsConfig::default();
        assert_eq!(config.request_queue_size, 256);
        assert_eq!(config.timeouts.read, Duration::from_secs(60));
        assert_eq!(config.timeouts.write, Duration::from_secs(5));
        assert_eq!(config.timeouts.request, Duration::from_secs(2));
        assert_eq!(config.timeouts.response, Duration::from_secs(10));
        assert_eq!(config.buffer_sizes.read, 65_536);
        assert_eq!(config.buffer_sizes.write, 131_072);
    }

    #[test]
    fn connections_config_defaults() {
        let config = ConnectionsConfig::default();
        assert_eq!(config.nshards, 8);
        assert_eq!(config.init_shard_size, 64);
    }

    #[test]
    fn shared_config_swaps_snapshots() {
        let shared = SharedConfig::default();
        assert_eq!(shared.load().port, 0);

        let snapshot_before = shared.load();
        shared.store(GatewayConfig {
            port: 9000,
            ..GatewayConfig::default()
        });

        // New readers see the swap; the old snapshot is unchanged.
        assert_eq!(shared.load().port, 9000);
        assert_eq!(snapshot_before.port, 0);
    }
}
