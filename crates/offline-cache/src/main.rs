//! Offline Cache - versioned offline caching front for a static site

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;

use config::{Config, LoggingConfig};
use offline_api::{AppState, create_router};
use offline_core::{OfflineCacheConfig, OfflineCacheManager, Release};
use offline_fetch::{Fetcher, HttpFetcher, HttpFetcherConfig};
use offline_storage::{CacheStore, LocalStore, MemoryStore};

/// Offline Cache - serves a site through a versioned offline cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    /// Bind address
    #[arg(long, env = "OFFLINE_CACHE_BIND")]
    bind: Option<String>,

    /// Port
    #[arg(short, long, env = "OFFLINE_CACHE_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;

    init_logging(&config.logging);

    info!("Starting Offline Cache v{}", env!("CARGO_PKG_VERSION"));

    let origin = config.site.origin_url()?;
    let release = Arc::new(config.site.release()?);

    // Initialize cache store
    let store: Arc<dyn CacheStore> = match config.storage.backend.as_str() {
        "memory" => {
            info!("Using in-memory cache store");
            Arc::new(MemoryStore::new())
        }
        _ => Arc::new(
            LocalStore::new(&config.storage.local.path)
                .await
                .with_context(|| {
                    format!("Failed to open cache store at {}", config.storage.local.path)
                })?,
        ),
    };

    // Initialize origin fetcher
    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(HttpFetcherConfig {
        user_agent: config.upstream.user_agent.clone(),
        skip_tls_verify: config.upstream.skip_tls_verify,
    })?);

    // Install the recorder before anything records
    let metrics_handle = if config.metrics.enabled {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("Failed to install Prometheus recorder")?;
        Some(Arc::new(handle))
    } else {
        None
    };

    // Initialize offline cache manager
    let manager = Arc::new(OfflineCacheManager::new(
        store,
        fetcher.clone(),
        OfflineCacheConfig {
            origin: origin.clone(),
            vary_headers: config.site.vary_headers.clone(),
        },
    ));

    // Install in the background; requests pass through until activation
    tokio::spawn(start_release(manager.clone(), release.clone()));

    let state = AppState::new(manager.clone(), fetcher, origin.clone(), release);

    let app = create_router(state, metrics_handle).layer(TraceLayer::new_for_http());

    let bind_addr = args.bind.unwrap_or(config.server.bind_address);
    let port = args.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", bind_addr, port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", bind_addr, port))?;

    info!("Listening on {}", addr);
    info!("Origin: {}", origin);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.settle().await;

    info!("Server stopped");
    Ok(())
}

/// Bring the configured release into service
///
/// A generation already complete in the store is adopted as-is and only the
/// purge of older generations is re-run; otherwise it is installed from the
/// origin. Failures leave whatever was serving in place.
async fn start_release(manager: Arc<OfflineCacheManager>, release: Arc<Release>) {
    let generation = release.generation();

    let resumed = match manager.resume(&release).await {
        Ok(resumed) => resumed,
        Err(e) => {
            warn!("Could not inspect existing cache for {}: {}", generation, e);
            false
        }
    };

    let result = if resumed {
        manager.activate().await.map(|activated| activated.deleted.len())
    } else {
        manager
            .install_and_activate(&release)
            .await
            .map(|(_, activated)| activated.deleted.len())
    };

    match result {
        Ok(deleted) => info!(
            "{} is serving ({} old generation(s) removed)",
            generation, deleted
        ),
        Err(e) => match manager.active_generation() {
            Some(active) => warn!(
                "Could not bring {} into service: {}; {} keeps serving",
                generation, e, active
            ),
            None => warn!(
                "Could not bring {} into service: {}; passing requests through",
                generation, e
            ),
        },
    }
}

/// Initialize logging
fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for CTRL+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
