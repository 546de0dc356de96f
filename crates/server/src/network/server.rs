//! Iroh P2P network server for the publisher/relay binary.
//!
//! Manages the Iroh endpoint, accepts peer connections, enforces the peer
//! allowlist, and spawns a [`media_core::Connection`] per accepted
//! connection. Grounded on `rust-p2p-usb`'s `IrohServer` (endpoint
//! bootstrap, allowlist enforcement, per-connection spawn loop).

use anyhow::{Context, Result, anyhow};
use common::{ALPN_PROTOCOL, load_or_generate_secret_key};
use iroh::{Endpoint, PublicKey as EndpointId};
use media_core::Connection;
use media_core::quic::iroh_adapter::IrohConnection;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;

/// Iroh P2P server for the media transport.
///
/// Manages the Iroh network endpoint, accepts incoming peer connections,
/// enforces EndpointId allowlists, and spawns a task to drive each
/// connection's [`media_core::Connection`] state machine.
pub struct IrohServer {
    endpoint: Endpoint,
    allowed_peers: Arc<RwLock<HashSet<EndpointId>>>,
    config: ServerConfig,
}

impl IrohServer {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        info!("Initializing Iroh P2P server...");

        let secret_key = load_or_generate_secret_key(config.node.secret_key_path.as_deref())
            .context("Failed to load or generate secret key")?;

        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![ALPN_PROTOCOL.to_vec()])
            .bind()
            .await
            .context("Failed to create Iroh endpoint")?;

        let _ = endpoint.online().await;

        let allowed_peers = Self::parse_allowlist(&config.security.allowed_peers)?;

        let endpoint_id = endpoint.id();
        info!("Server EndpointId: {}", endpoint_id);

        if config.security.require_approval {
            info!("Peer allowlist enabled with {} entries", allowed_peers.len());
        } else {
            warn!("Peer allowlist disabled - accepting all connections");
        }

        Ok(Self {
            endpoint,
            allowed_peers: Arc::new(RwLock::new(allowed_peers)),
            config,
        })
    }

    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint.id()
    }

    pub fn local_addrs(&self) -> Vec<std::net::SocketAddr> {
        self.endpoint.bound_sockets().iter().copied().collect()
    }

    /// Accept connections until the endpoint closes, spawning a
    /// [`media_core::Connection`] driver task per connection.
    pub async fn run(self) -> Result<()> {
        info!("Server running, waiting for connections...");

        loop {
            let incoming = match self.endpoint.accept().await {
                Some(conn) => conn,
                None => {
                    warn!("Endpoint closed, shutting down");
                    break;
                }
            };

            let allowed_peers = self.allowed_peers.clone();
            let require_approval = self.config.security.require_approval;

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(incoming, allowed_peers, require_approval).await
                {
                    error!("Connection error: {:#}", e);
                }
            });
        }

        Ok(())
    }

    async fn handle_connection(
        incoming: iroh::endpoint::Incoming,
        allowed_peers: Arc<RwLock<HashSet<EndpointId>>>,
        require_approval: bool,
    ) -> Result<()> {
        let connection = incoming.await.context("Failed to establish connection")?;
        let remote_endpoint_id = connection.remote_id();

        debug!("Connection attempt from: {}", remote_endpoint_id);

        if require_approval {
            let peers = allowed_peers.read().await;
            if !peers.is_empty() && !peers.contains(&remote_endpoint_id) {
                warn!(
                    "Rejected connection from unauthorized EndpointId: {}",
                    remote_endpoint_id
                );
                return Ok(());
            }
        }

        info!("Accepted connection from: {}", remote_endpoint_id);

        let conn = Connection::new(IrohConnection(connection));
        conn.run().await.map_err(|e| anyhow!("connection driver failed: {}", e))?;

        info!("Connection closed: {}", remote_endpoint_id);
        Ok(())
    }

    fn parse_allowlist(allowed_peers: &[String]) -> Result<HashSet<EndpointId>> {
        let mut allowlist = HashSet::new();

        for peer_str in allowed_peers {
            if peer_str.is_empty() {
                continue;
            }
            match peer_str.parse::<EndpointId>() {
                Ok(endpoint_id) => {
                    allowlist.insert(endpoint_id);
                }
                Err(e) => {
                    warn!("Failed to parse EndpointId '{}': {}", peer_str, e);
                }
            }
        }

        Ok(allowlist)
    }

    #[allow(dead_code)]
    pub async fn add_peer(&self, endpoint_id: EndpointId) {
        let mut peers = self.allowed_peers.write().await;
        peers.insert(endpoint_id);
        info!("Added peer to allowlist: {}", endpoint_id);
    }

    #[allow(dead_code)]
    pub async fn remove_peer(&self, endpoint_id: &EndpointId) -> Result<()> {
        let mut peers = self.allowed_peers.write().await;
        if peers.remove(endpoint_id) {
            info!("Removed peer from allowlist: {}", endpoint_id);
            Ok(())
        } else {
            Err(anyhow!("Peer not in allowlist: {}", endpoint_id))
        }
    }

    #[allow(dead_code)]
    pub async fn shutdown(self) {
        info!("Shutting down Iroh server...");
        self.endpoint.close().await;
        info!("Server shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn server_creation_assigns_an_endpoint_id() {
        let config = ServerConfig::default();
        let server = IrohServer::new(config).await;
        assert!(server.is_ok());
        let server = server.unwrap();
        assert_eq!(server.endpoint_id().to_string().len(), 64);
    }

    #[tokio::test]
    async fn empty_allowlist_parses_to_empty_set() {
        let allowlist = IrohServer::parse_allowlist(&[]).unwrap();
        assert_eq!(allowlist.len(), 0);
    }

    #[tokio::test]
    async fn add_and_remove_peer_round_trips() {
        let config = ServerConfig::default();
        let server = IrohServer::new(config).await.unwrap();
        let test_id = server.endpoint_id();

        server.add_peer(test_id).await;
        assert!(server.allowed_peers.read().await.contains(&test_id));

        server.remove_peer(&test_id).await.unwrap();
        assert!(!server.allowed_peers.read().await.contains(&test_id));
    }
}
