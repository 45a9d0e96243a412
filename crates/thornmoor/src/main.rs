//! Thornmoor server entry point.
//!
//! Composition root: loads configuration, initializes logging, constructs
//! the realtime registry with its collaborators, and runs the WebSocket
//! accept loop until a termination signal arrives.

mod adapters;
mod cli;
mod config;
mod logging;
mod net;
mod shutdown;

use adapters::{AllowAllTokens, StaticDirectory};
use anyhow::Context;
use cli::CliArgs;
use config::AppConfig;
use net::WsTransport;
use realtime::ConnectionRegistry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let mut config = AppConfig::load(&args.config_path)
        .with_context(|| format!("loading config from {}", args.config_path.display()))?;
    if let Some(bind) = &args.bind_address {
        config.server.bind_address = bind.clone();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.json_logs {
        config.logging.json_format = true;
    }

    logging::setup_logging(&config.logging)?;
    info!("Thornmoor server v{}", env!("CARGO_PKG_VERSION"));

    // Collaborators, then the registry they plug into.
    let transport = Arc::new(WsTransport::new());
    let directory = Arc::new(StaticDirectory::from_entries(&config.rooms));
    let validator = Arc::new(AllowAllTokens);
    let registry = Arc::new(ConnectionRegistry::new(
        config.realtime.clone(),
        transport.clone(),
        validator,
        directory,
    ));

    let background = registry.start_background_tasks();
    info!("Health and cleanup loops running");

    let listener = TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("binding {}", config.server.bind_address))?;
    info!("Listening on {}", config.server.bind_address);

    let (accept_shutdown_tx, accept_shutdown_rx) = broadcast::channel(1);
    let accept_loop = tokio::spawn(net::run_accept_loop(
        listener,
        transport,
        registry.clone(),
        config.server.max_connections,
        accept_shutdown_rx,
    ));

    let shutdown_rx = shutdown::setup_shutdown_handler().await;
    let _ = shutdown_rx.await;

    info!("Shutting down");
    let _ = accept_shutdown_tx.send(());
    registry.shutdown();

    if let Err(e) = accept_loop.await {
        error!("Accept loop ended abnormally: {}", e);
    }
    for handle in background {
        let _ = handle.await;
    }

    let stats = registry.stats().await;
    info!(
        "Final state: {} connection(s), {} player(s) with pending messages",
        stats.connections.total_connections, stats.pending_messages.players_with_pending
    );
    info!("Server stopped");
    Ok(())
}
