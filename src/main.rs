//! Streaming gateway binary.
//!
//! # Architecture Overview
//!
//! ```text
//!                         ┌──────────────────────────────────────────────────────┐
//!                         │                  STREAMING GATEWAY                    │
//!                         │                                                       │
//!   Client request        │  ┌─────────┐   ┌─────────┐   ┌──────────────┐        │
//!   ──────────────────────┼─▶│   net   │──▶│  http   │──▶│   routing    │        │
//!                         │  │listener │   │ server  │   │   contract   │        │
//!                         │  └─────────┘   └─────────┘   └──────┬───────┘        │
//!                         │                                     ▼                 │
//!                         │                              ┌──────────────┐        │
//!                         │                              │    proxy     │        │
//!                         │                              │ orchestrator │        │
//!                         │                              └──────┬───────┘        │
//!                         │                                     ▼                 │
//!   Client response       │  ┌─────────┐   ┌─────────┐   ┌──────────────┐        │
//!   ◀─────────────────────┼──│response │◀──│ channel │◀─▶│ pool + conn  │◀───────┼──▶ Downstream
//!                         │  │ sender  │   │         │   │    loop      │        │
//!                         │  └─────────┘   └─────────┘   └──────────────┘        │
//!                         │                                                       │
//!                         │  config · observability · resilience · lifecycle      │
//!                         └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use stream_gateway::config::loader::load_config;
use stream_gateway::config::watcher::ConfigWatcher;
use stream_gateway::config::GatewayConfig;
use stream_gateway::lifecycle::{wait_for_signal, Shutdown};
use stream_gateway::observability::{logging, metrics};
use stream_gateway::HttpServer;

#[derive(Debug, Parser)]
#[command(name = "stream-gateway", version, about = "Streaming HTTP gateway")]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };

    logging::init_logging(&config.observability)?;
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        tracing::debug!("rustls crypto provider already installed");
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "stream-gateway starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        active_call_idle_ms = config.timeouts.active_call_idle_ms,
        pool_idle_ms = config.timeouts.pool_idle_ms,
        routes = config.routes.len(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    // Keep the watcher alive for the lifetime of the server.
    let (config_updates, _watcher) = match &cli.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            (updates, Some(watcher.run()?))
        }
        None => (mpsc::unbounded_channel().1, None),
    };

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Arc::new(Shutdown::new());
    let server = HttpServer::new(config)?;
    let server_task = tokio::spawn(server.run(listener, config_updates, shutdown.subscribe()));

    let signal_shutdown = Arc::clone(&shutdown);
    tokio::spawn(async move {
        wait_for_signal().await;
        signal_shutdown.trigger();
    });

    server_task.await??;
    tracing::info!("Shutdown complete");
    Ok(())
}
