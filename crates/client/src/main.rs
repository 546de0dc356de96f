//! media-quic subscriber binary.
//!
//! Connects to a publisher or relay, issues `REQUEST`/`SUBSCRIBE`, and logs
//! delivered objects and notifications as they arrive.

mod config;
mod network;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::setup_logging;
use iroh::PublicKey as EndpointId;
use network::{SubscriberClient, SubscriberClientConfig};
use protocol::{MediaId, SubscribeIntent, TransportMode};
use std::collections::HashSet;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "media-quic-subscriber")]
#[command(
    author,
    version,
    about = "media-quic subscriber - request and subscribe to named media objects over QUIC"
)]
#[command(long_about = "
A QUIC-based media transport subscriber using Iroh P2P networking.

EXAMPLES:
    # Request a single object stream from a publisher
    media-quic-subscriber --connect <publisher-endpoint-id> --request camera/front

    # Subscribe to notifications for every URL under a prefix
    media-quic-subscriber --connect <publisher-endpoint-id> --subscribe camera/

    # Run with custom config (auto-subscribes to [subscribe].prefixes)
    media-quic-subscriber --config /path/to/config.toml --connect <publisher-endpoint-id>

CONFIGURATION:
    The subscriber looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/media-quic/subscriber.toml
    3. /etc/media-quic/subscriber.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Publisher/relay EndpointId to connect to
    #[arg(long, value_name = "ENDPOINT_ID")]
    connect: Option<String>,

    /// Issue REQUEST for this URL and print delivered objects
    #[arg(long, value_name = "URL")]
    request: Option<String>,

    /// Transport mode for --request (single-stream, datagram, warp, rush)
    #[arg(long, value_name = "MODE")]
    transport_mode: Option<String>,

    /// Issue SUBSCRIBE for this URL prefix and print NOTIFYs
    #[arg(long, value_name = "PREFIX")]
    subscribe: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = config::SubscriberConfig::default();
        let path = config::SubscriberConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        config::SubscriberConfig::load(Some(path.clone()))
            .context("Failed to load configuration")?
    } else {
        config::SubscriberConfig::load_or_default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.node.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("media-quic subscriber v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let client = create_subscriber_client(&config).await?;
    info!("Subscriber EndpointId: {}", client.endpoint_id());

    let Some(publisher_id_str) = args.connect else {
        info!("No --connect given; nothing to do. Pass --connect <publisher-endpoint-id>.");
        return Ok(());
    };
    let publisher_id = publisher_id_str
        .parse::<EndpointId>()
        .context("Invalid publisher EndpointId format")?;

    client.connect(publisher_id, None).await.context("Failed to connect to publisher")?;
    let mut events = client.events(&publisher_id).await?;

    if let Some(url) = args.request {
        let transport_mode = parse_transport_mode(
            args.transport_mode
                .as_deref()
                .unwrap_or("warp"),
        )?;
        info!("Requesting '{}' over {:?}", url, transport_mode);
        client
            .request(publisher_id, url, transport_mode, SubscribeIntent::CurrentGroup)
            .await?;
    }

    if let Some(prefix) = args.subscribe {
        info!("Subscribing to prefix '{}'", prefix);
        client.subscribe(publisher_id, prefix).await?;
    }

    for prefix in &config.subscribe.prefixes {
        info!("Auto-subscribing to configured prefix '{}'", prefix);
        client.subscribe(publisher_id, prefix.clone()).await?;
    }

    let forward = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(network::MediaEvent::Notify { url }) => {
                    info!("NOTIFY: {}", url);
                }
                Ok(network::MediaEvent::ObjectReady { media_id, delivery }) => {
                    log_delivery(media_id, &delivery);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("dropped {} events while catching up", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    wait_for_shutdown().await?;
    forward.abort();

    info!("Subscriber shutting down...");
    client.shutdown().await
}

fn log_delivery(media_id: MediaId, delivery: &media_core::reassembly::Delivery) {
    info!(
        "object ready: media={:?} group={:?} object={:?} mode={:?} len={}",
        media_id,
        delivery.key.group_id,
        delivery.key.object_id,
        delivery.mode,
        delivery.data.len()
    );
}

fn parse_transport_mode(s: &str) -> Result<TransportMode> {
    match s {
        "single-stream" | "single_stream" => Ok(TransportMode::SingleStream),
        "datagram" => Ok(TransportMode::Datagram),
        "warp" => Ok(TransportMode::Warp),
        "rush" => Ok(TransportMode::Rush),
        other => Err(anyhow!(
            "unknown transport mode '{}': expected single-stream, datagram, warp, or rush",
            other
        )),
    }
}

/// Build the Iroh client with configuration.
async fn create_subscriber_client(config: &config::SubscriberConfig) -> Result<SubscriberClient> {
    let mut allowed_publishers = HashSet::new();
    for publisher_str in &config.security.allowed_publishers {
        if !publisher_str.is_empty() {
            match publisher_str.parse::<EndpointId>() {
                Ok(endpoint_id) => {
                    allowed_publishers.insert(endpoint_id);
                }
                Err(e) => {
                    warn!("Failed to parse publisher EndpointId '{}': {}", publisher_str, e);
                }
            }
        }
    }

    let network_config = SubscriberClientConfig {
        allowed_publishers,
        alpn: common::ALPN_PROTOCOL.to_vec(),
        secret_key_path: config.node.secret_key_path.clone(),
    };

    SubscriberClient::new(network_config).await
}

/// Wait for Ctrl+C signal.
async fn wait_for_shutdown() -> Result<()> {
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
        Err(e) => Err(anyhow!("Error waiting for Ctrl+C: {}", e)),
    }
}
