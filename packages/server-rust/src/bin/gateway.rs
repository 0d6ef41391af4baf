//! The gateway daemon.
//!
//! Wires the application context in dependency order — config, channel
//! registry, channel store, middleware registry, gateway module — loads
//! channel definitions from an optional JSON seed file, and serves until
//! ctrl-c, at which point every channel manager drains before exit.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use devicehub_core::{Channel, ChannelHash};
use devicehub_server::pipeline::{IndexerMiddleware, LoggerMiddleware, NullIndexSink};
use devicehub_server::{
    ChannelRegistry, GatewayConfig, GatewayModule, MemoryChannelStore, MiddlewareRegistry,
    SharedConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gateway", about = "DeviceHub device gateway")]
struct Args {
    /// Bind address.
    #[arg(long, env = "DEVICEHUB_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Bind port.
    #[arg(long, env = "DEVICEHUB_PORT", default_value_t = 8080)]
    port: u16,

    /// Salt for channel hash-ids. Must stay stable across restarts or every
    /// published channel handle breaks.
    #[arg(long, env = "DEVICEHUB_HASH_SALT")]
    hash_salt: String,

    /// JSON file with channel definitions to load at boot.
    #[arg(long, env = "DEVICEHUB_CHANNELS")]
    channels: Option<PathBuf>,

    /// Prometheus exporter bind address (e.g. 0.0.0.0:9090). Disabled when
    /// absent.
    #[arg(long, env = "DEVICEHUB_METRICS_ADDR")]
    metrics_addr: Option<std::net::SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("devicehub_server=info,devicehub_core=info")),
        )
        .init();

    if let Some(addr) = args.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing prometheus exporter")?;
        info!(%addr, "prometheus exporter listening");
    }
    devicehub_server::metrics::describe();

    let config = Arc::new(SharedConfig::new(GatewayConfig {
        host: args.host,
        port: args.port,
        ..GatewayConfig::default()
    }));
    let registry = Arc::new(ChannelRegistry::new(Arc::clone(&config)));
    let hash_codec = Arc::new(ChannelHash::new(&args.hash_salt)?);
    let store = Arc::new(MemoryChannelStore::new(
        Arc::clone(&registry),
        Arc::clone(&hash_codec),
    ));

    if let Some(path) = &args.channels {
        let raw = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let definitions: Vec<Channel> =
            serde_json::from_slice(&raw).context("parsing channel definitions")?;
        for definition in definitions {
            let channel = store.create(definition)?;
            info!(
                channel = channel.id,
                name = %channel.name,
                handle = %hash_codec.encode(channel.id),
                "channel loaded"
            );
        }
    }

    let mut handlers = MiddlewareRegistry::new();
    handlers.register("logger", Arc::new(LoggerMiddleware));
    handlers.register(
        "indexer",
        Arc::new(IndexerMiddleware::new(Arc::new(NullIndexSink))),
    );

    let mut module = GatewayModule::new(
        config,
        registry,
        store,
        Arc::new(handlers),
        hash_codec,
    );
    module.start().await?;
    module
        .serve(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
}
