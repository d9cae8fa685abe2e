//! TideDB Server - HTTP API for the rolling-bucket time-series store

mod api;

use anyhow::Context;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tidedb_core::config::FINALIZE_INTERVAL_SECS;
use tidedb_core::service::{ServiceConfig, TideService};
use tidedb_core::shard::ShardConfig;
use tidedb_core::ShardId;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Data directory
    pub data_dir: PathBuf,
    /// Shards served by this process
    pub shards: Vec<ShardId>,
    /// Period of bucket finalization and cold series eviction
    pub finalize_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8086)),
            data_dir: PathBuf::from("data"),
            shards: vec![1],
            finalize_interval: Duration::from_secs(FINALIZE_INTERVAL_SECS),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `TIDEDB_*` environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("TIDEDB_HTTP_ADDR") {
            config.http_addr = addr
                .parse()
                .with_context(|| format!("invalid TIDEDB_HTTP_ADDR: {}", addr))?;
        }
        if let Ok(dir) = std::env::var("TIDEDB_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(shards) = std::env::var("TIDEDB_SHARDS") {
            config.shards = parse_shards(&shards)?;
        }
        if let Ok(secs) = std::env::var("TIDEDB_FINALIZE_INTERVAL") {
            let secs: u64 = secs
                .parse()
                .with_context(|| format!("invalid TIDEDB_FINALIZE_INTERVAL: {}", secs))?;
            anyhow::ensure!(secs > 0, "TIDEDB_FINALIZE_INTERVAL must be positive");
            config.finalize_interval = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

fn parse_shards(list: &str) -> anyhow::Result<Vec<ShardId>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<ShardId>()
                .with_context(|| format!("invalid shard id: {}", s))
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ServerConfig::from_env()?;

    info!("Starting TideDB server...");
    info!("Data directory: {:?}", config.data_dir);
    info!("Shards: {:?}", config.shards);
    info!("HTTP server: http://{}", config.http_addr);

    let service = TideService::new(ServiceConfig {
        shards: config.shards.clone(),
        shard: ShardConfig::default(),
        data_dir: Some(config.data_dir.clone()),
    })?;
    let service = Arc::new(service);

    // Recover in the background; writes are queued and reads answer
    // "in progress" until each shard gets far enough
    let recovering = service.clone();
    tokio::spawn(async move {
        match tokio::task::spawn_blocking(move || recovering.start()).await {
            Ok(Ok(())) => info!("All shards recovered"),
            Ok(Err(e)) => error!("Shard recovery failed: {}", e),
            Err(e) => error!("Shard recovery task panicked: {}", e),
        }
    });

    tokio::spawn(housekeeping(service.clone(), config.finalize_interval));

    // Create router
    let app = api::create_router(service);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!("TideDB server listening on {}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("TideDB server stopped");
    Ok(())
}

/// Finalize closed buckets and drop cold series on a fixed period
async fn housekeeping(service: Arc<TideService>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let service = service.clone();
        let result = tokio::task::spawn_blocking(move || {
            let finalized = service.finalize_now()?;
            let evicted = service.evict_cold_series()?;
            Ok::<_, tidedb_core::TideError>((finalized, evicted))
        })
        .await;

        match result {
            Ok(Ok((finalized, evicted))) if finalized + evicted > 0 => {
                info!("Finalized {} buckets, evicted {} series", finalized, evicted)
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!("Housekeeping failed: {}", e),
            Err(e) => error!("Housekeeping task panicked: {}", e),
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
