//! # Registrar - Rollcall coordination server
//!
//! Keeps a shared directory of resources and the associations between
//! them, tracks which servers and client connections are alive, elects a
//! single leader to reap dead servers, and pushes every change to the
//! clients that subscribed to it.
//!
//! ## Architecture
//! ```text
//! Client ──SSE/HTTP──> Registrar ──┐
//! Client ──SSE/HTTP──> Registrar ──┼──> Redis (shared tables)
//! Client ──SSE/HTTP──> Registrar ──┘
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod access;
mod cache;
mod changelog;
mod cluster;
mod config;
mod graph;
mod routes;
mod state;
mod store;
mod subscriptions;
mod transport;

use cluster::{ChangeDispatcher, DispatcherConfig, connection_worker};
use config::AppConfig;
use state::AppState;
use transport::{ConnectionHub, Transport};

/// Rollcall Registrar - resource directory coordination server
#[derive(Parser, Debug)]
#[command(name = "registrar")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/registrar.toml")]
    config: String,

    /// Redis URL (overrides config, selects the Redis store)
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long, env = "LISTEN_ADDR")]
    listen: Option<String>,

    /// Address other servers and clients know this server by
    #[arg(short, long, env = "ADVERTISE_ADDR")]
    advertise: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.json_logs)?;

    info!(
        "🔥 Starting Rollcall Registrar v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Load configuration
    let config = AppConfig::load(&args.config, &args)?;
    info!("📋 Configuration loaded from {}", args.config);

    // Create shutdown broadcast channel
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    // Connection hub and its lifecycle events
    let (hub, connection_events) = ConnectionHub::new(config.cluster.connection_buffer);
    let hub = Arc::new(hub);

    // Initialize application state
    let state = AppState::new(config.clone(), hub.clone()).await?;
    let server = config.server_address().to_string();

    // Join the cluster before serving
    state
        .leader
        .startup()
        .await
        .context("Failed to register with the cluster")?;
    info!("🤝 Registered as {}", server);

    // Spawn leader timer
    let leader_task = tokio::spawn(
        state
            .leader
            .clone()
            .run(config.cluster.leader_period(), shutdown_tx.subscribe()),
    );

    // Spawn change dispatcher
    let dispatcher = ChangeDispatcher::new(
        DispatcherConfig {
            servers: BTreeSet::from([server.clone()]),
            period: config.cluster.dispatch_period(),
            push_timeout: config.cluster.push_timeout(),
        },
        state.gateway.clone(),
        hub.clone(),
        state.cache.clone(),
    )
    .await
    .context("Failed to position the change dispatcher")?;
    let dispatcher_task = tokio::spawn(dispatcher.run(shutdown_tx.subscribe()));

    // Spawn connection lifecycle worker
    let connection_task = tokio::spawn(connection_worker(
        state.leader.clone(),
        hub.clone(),
        connection_events,
        shutdown_tx.subscribe(),
    ));

    let leader = state.leader.clone();

    // Build router
    let app = routes::create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!("🚀 Registrar listening on {}", config.listen_addr);

    // Handle graceful shutdown
    let signal_tx = shutdown_tx.clone();
    let signal_hub = hub.clone();
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
        info!("🛑 Shutdown signal received");
        let _ = signal_tx.send(());
        // Open push streams would otherwise hold the server open
        signal_hub.disconnect_all().await;
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await
    .context("Server error")?;

    // Stop background workers, then leave the cluster
    let _ = shutdown_tx.send(());
    for task in [leader_task, dispatcher_task, connection_task] {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Background task ended abnormally");
        }
    }
    leader
        .shutdown()
        .await
        .context("Failed to deregister from the cluster")?;

    info!("👋 Registrar shutdown complete");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}
