//! # Hark Server
//!
//! Presence and WebRTC signaling relay.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! hark
//!
//! # Run with custom config
//! hark --config /path/to/hark.toml
//!
//! # Run with environment variables
//! HARK_PORT=8080 HARK_HOST=0.0.0.0 HARK_PRESENCE__EVICT_DISPLACED=false hark
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Presence and WebRTC signaling relay.
#[derive(Debug, Parser)]
#[command(name = "hark", version, about)]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hark=debug,hark_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = crate::config::Config::load(args.config.as_deref())?;

    tracing::info!("Starting Hark server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
