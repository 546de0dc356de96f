//! media-quic publisher/relay binary.
//!
//! Runs an Iroh QUIC endpoint that accepts subscriber/relay connections and
//! serves media objects from locally published sources, optionally relaying
//! from upstream publishers per `[relay]` config.

mod config;
mod network;

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use network::IrohServer;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "media-quic-server")]
#[command(
    author,
    version,
    about = "media-quic publisher/relay - serve named media objects over QUIC"
)]
#[command(long_about = "
A QUIC-based media transport publisher/relay using Iroh P2P networking.

EXAMPLES:
    # Run with default config
    media-quic-server

    # Run with custom config
    media-quic-server --config /path/to/config.toml

    # List locally published sources without starting the network loop
    media-quic-server --list-sources

CONFIGURATION:
    The server looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/media-quic/server.toml
    3. /etc/media-quic/server.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to the default location and exit
    #[arg(long)]
    save_config: bool,

    /// List locally published sources and exit
    #[arg(long)]
    list_sources: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = config::ServerConfig::default();
        let path = config::ServerConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        config::ServerConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        config::ServerConfig::load_or_default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.node.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("media-quic server v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    if args.list_sources {
        return list_sources_mode();
    }

    if config.is_relay() {
        info!("Relay mode: {} upstream(s) configured", config.relay.upstreams.len());
    }

    run_headless(config).await
}

/// Print locally published sources without starting the network loop.
///
/// Mirrors a `--list-devices` style introspection flag; this
/// binary's source registry is populated at startup from local media
/// configuration rather than probed hardware, so the listing is currently
/// always empty until source configuration is wired up.
fn list_sources_mode() -> Result<()> {
    println!("No locally published sources configured.");
    Ok(())
}

/// Run the server until Ctrl+C.
async fn run_headless(config: config::ServerConfig) -> Result<()> {
    let server = IrohServer::new(config)
        .await
        .context("Failed to initialize Iroh server")?;

    info!("Server EndpointId: {}", server.endpoint_id());
    info!("Listening on: {:?}", server.local_addrs());
    info!("Press Ctrl+C to shutdown");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!("Server error: {:#}", e);
        }
    });

    signal::ctrl_c().await.ok();
    info!("Received Ctrl+C, shutting down gracefully...");
    server_handle.abort();

    Ok(())
}
