//! pincache: pinned-object disk cache service.
//!
//! Serves the lock/session/transfer API over HTTP and runs the periodic
//! collector in the background.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use pincache::config::{Cli, Config};
use pincache::server::api::{build_router, AppState};
use pincache::service::PinCache;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "pincache=debug,tower_http=debug"
    } else {
        "pincache=info,tower_http=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());

    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("pincache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }

    info!(
        root = %config.storage.root.display(),
        capacity_bytes = config.storage.capacity_bytes,
        backend = ?config.store.backend,
        "Configuration loaded"
    );
    info!(
        interval_secs = config.gc.interval_secs,
        start = config.gc.start_fraction,
        stop = config.gc.stop_fraction,
        "Collector thresholds"
    );

    // Open the store, build handlers and start background work.
    let cache = Arc::new(PinCache::open(&config).await?);
    let _gc = cache.start().await?;

    // Build the HTTP router.
    let app = build_router(AppState { cache });

    // Start the server.
    let listen_addr = config.server.listen;
    info!(addr = %listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
