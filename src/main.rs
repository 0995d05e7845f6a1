//! Retry Gateway (v1)
//!
//! A reverse proxy that retries requests failing at the transport level,
//! built with Tokio and Axum.
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌──────────────────────────────────────────────────────┐
//!                      │                    RETRY GATEWAY                      │
//!                      │                                                       │
//!   Client Request     │  ┌─────────┐    ┌─────────┐    ┌──────────────┐      │
//!   ───────────────────┼─▶│  http   │───▶│  retry  │───▶│  forwarder   │──────┼──▶ Backend
//!                      │  │ server  │    │ (replay)│    │ round-robin  │      │
//!                      │  └─────────┘    └────┬────┘    └──────┬───────┘      │
//!                      │                      │                │ net error    │
//!                      │                      ▼                ▼              │
//!   Client Response    │  ┌─────────┐    ┌─────────┐    ┌──────────────┐      │
//!   ◀──────────────────┼──│streaming│◀───│recorder │◀───│ net error    │      │
//!                      │  │  sink   │    │ buffer  │    │   signal     │      │
//!                      │  └─────────┘    └─────────┘    └──────────────┘      │
//!                      │                                                       │
//!                      │   config · observability · lifecycle                  │
//!                      └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use retry_gateway::config::load_config;
use retry_gateway::http::HttpServer;
use retry_gateway::lifecycle::{signals::shutdown_signal, Shutdown};
use retry_gateway::observability::{logging, metrics};

#[derive(Parser, Debug)]
#[command(name = "retry-gateway", version, about = "Reverse proxy with transport-level retries")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "gateway.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = load_config(&cli.config)?;
    logging::init_logging(&config.observability);

    tracing::info!("retry-gateway v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        backends = config.backends.len(),
        attempts = config.retries.attempts,
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics endpoint");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    let server = HttpServer::new(config)?;

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        shutdown.trigger_on(shutdown_signal()).await;
    });

    server.run(listener, server_shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
