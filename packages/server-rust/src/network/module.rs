//! Gateway module with deferred startup lifecycle.
//!
//! Implements the deferred startup pattern: `new()` wires the shared state,
//! `start()` binds the TCP listener, and `serve()` accepts connections
//! until shutdown. Construction order across the application is Config →
//! Registry → Store → Gateway, teardown the reverse: after the HTTP server
//! stops accepting, the registry drains every channel's connection manager
//! before the module reports Stopped.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use devicehub_core::{ChannelHash, ChannelResolver};
use tokio::net::TcpListener;
use tracing::info;

use super::config::SharedConfig;
use super::handlers::{
    health_handler, liveness_handler, poll_handler, push_handler, readiness_handler,
    ws_upgrade_handler, AppState,
};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use crate::connections::ChannelRegistry;
use crate::pipeline::MiddlewareRegistry;

/// Manages the full HTTP/WebSocket gateway lifecycle.
///
/// Dependencies are passed in explicitly rather than reached through
/// globals; the module owns only the listener and the shutdown controller.
pub struct GatewayModule {
    config: Arc<SharedConfig>,
    registry: Arc<ChannelRegistry>,
    resolver: Arc<dyn ChannelResolver>,
    handlers: Arc<MiddlewareRegistry>,
    hash_codec: Arc<ChannelHash>,
    shutdown: Arc<ShutdownController>,
    listener: Option<TcpListener>,
}

impl GatewayModule {
    /// Creates a gateway module without binding any port.
    #[must_use]
    pub fn new(
        config: Arc<SharedConfig>,
        registry: Arc<ChannelRegistry>,
        resolver: Arc<dyn ChannelResolver>,
        handlers: Arc<MiddlewareRegistry>,
        hash_codec: Arc<ChannelHash>,
    ) -> Self {
        Self {
            config,
            registry,
            resolver,
            handlers,
            hash_codec,
            shutdown: Arc::new(ShutdownController::new()),
            listener: None,
        }
    }

    /// Returns a shared reference to the channel registry.
    #[must_use]
    pub fn registry(&self) -> Arc<ChannelRegistry> {
        Arc::clone(&self.registry)
    }

    /// Returns a shared reference to the shutdown controller.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// The device-facing and health routes, without state or layers.
    /// Shared between `serve` and router-level tests.
    pub fn device_routes() -> Router<AppState> {
        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .route(
                "/channels/{channel_hash}/devices/{device_id}/ws",
                get(ws_upgrade_handler),
            )
            .route(
                "/channels/{channel_hash}/devices/{device_id}/push",
                post(push_handler),
            )
            .route(
                "/channels/{channel_hash}/devices/{device_id}/poll",
                get(poll_handler),
            )
    }

    fn app_state(&self) -> AppState {
        AppState {
            registry: Arc::clone(&self.registry),
            resolver: Arc::clone(&self.resolver),
            handlers: Arc::clone(&self.handlers),
            hash_codec: Arc::clone(&self.hash_codec),
            config: Arc::clone(&self.config),
            shutdown: Arc::clone(&self.shutdown),
            start_time: Instant::now(),
        }
    }

    /// Assembles the axum router with all routes and middleware.
    #[must_use]
    pub fn build_router(&self) -> Router {
        let layers = build_http_layers(&self.config.load());
        Self::device_routes()
            .layer(layers)
            .with_state(self.app_state())
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the actual bound port, which may differ from the configured
    /// port when port 0 is used (OS-assigned ephemeral port).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let snapshot = self.config.load();
        let addr = format!("{}:{}", snapshot.host, snapshot.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("gateway listening on {}:{}", snapshot.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves connections until the shutdown signal fires, then drains:
    /// every channel manager closes and every device connection reaches
    /// terminal state before this returns.
    ///
    /// Consumes `self` because the listener is moved into the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server encounters a fatal I/O error.
    ///
    /// # Panics
    ///
    /// Panics if `start()` was not called before `serve()`.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .expect("start() must be called before serve()");
        let router = self.build_router();
        let snapshot = self.config.load();

        self.shutdown.set_ready();

        if let Some(ref tls) = snapshot.tls {
            serve_tls(listener, router, tls, shutdown).await?;
        } else {
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await?;
        }

        self.drain().await;
        Ok(())
    }

    /// Closes every channel manager and transitions Draining → Stopped.
    async fn drain(&self) {
        self.shutdown.trigger_shutdown();
        let live = self.registry.total_connections();
        if live > 0 {
            info!(connections = live, "draining device connections");
        }
        self.registry.close_all().await;
        self.shutdown.set_stopped();
        info!("gateway drained");
    }
}

/// Serves TLS connections using `axum-server` with rustls, reusing the
/// pre-bound listener.
async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls: &super::config::TlsConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let rustls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load TLS certificates: {e}"))?;

    let addr = listener.local_addr()?;
    let std_listener = listener.into_std()?;
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();

    tokio::spawn(async move {
        shutdown.await;
        shutdown_handle.graceful_shutdown(None);
    });

    info!("serving TLS connections on {}", addr);

    axum_server::from_tcp_rustls(std_listener, rustls_config)
        .handle(handle)
        .serve(router.into_make_service())
        .await?;
    Ok(())
}
