//! Iroh network client.
//!
//! Manages the subscriber's Iroh endpoint and the set of connections it
//! holds open to publishers/relays, with allowlist enforcement. Grounded on
//! an `IrohClient` shape (endpoint bootstrap, connection pool keyed by
//! `EndpointId`, allowlist enforcement before dialing).

use anyhow::{Context, Result, anyhow};
use common::{ALPN_PROTOCOL, load_or_generate_secret_key};
use iroh::{Endpoint, EndpointAddr, PublicKey as EndpointId};
use protocol::{MediaId, SubscribeIntent, TransportMode};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use super::connection::{MediaEvent, PublisherConnection};

/// Iroh P2P client for subscribing to media from one or more publishers.
pub struct SubscriberClient {
    endpoint: Endpoint,
    allowed_publishers: Arc<RwLock<HashSet<EndpointId>>>,
    connections: Arc<Mutex<HashMap<EndpointId, Arc<PublisherConnection>>>>,
}

/// Client configuration used to build the Iroh endpoint.
#[derive(Debug, Clone)]
pub struct SubscriberClientConfig {
    pub allowed_publishers: HashSet<EndpointId>,
    pub alpn: Vec<u8>,
    pub secret_key_path: Option<PathBuf>,
}

impl Default for SubscriberClientConfig {
    fn default() -> Self {
        Self {
            allowed_publishers: HashSet::new(),
            alpn: ALPN_PROTOCOL.to_vec(),
            secret_key_path: None,
        }
    }
}

impl SubscriberClient {
    pub async fn new(config: SubscriberClientConfig) -> Result<Self> {
        let secret_key = load_or_generate_secret_key(config.secret_key_path.as_deref())
            .context("Failed to load or generate secret key")?;

        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![config.alpn.clone()])
            .bind()
            .await
            .context("Failed to create Iroh endpoint")?;

        info!("Subscriber EndpointId: {}", endpoint.id());

        Ok(Self {
            endpoint,
            allowed_publishers: Arc::new(RwLock::new(config.allowed_publishers)),
            connections: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint.id()
    }

    async fn is_publisher_allowed(&self, publisher_id: &EndpointId) -> bool {
        let allowlist = self.allowed_publishers.read().await;
        allowlist.is_empty() || allowlist.contains(publisher_id)
    }

    /// Connect to a publisher, reusing an existing connection if present.
    pub async fn connect(
        &self,
        publisher_id: EndpointId,
        publisher_addr: Option<EndpointAddr>,
    ) -> Result<Arc<PublisherConnection>> {
        if !self.is_publisher_allowed(&publisher_id).await {
            warn!("Attempted connection to non-allowed publisher: {}", publisher_id);
            return Err(anyhow!("Publisher {} not in allowlist", publisher_id));
        }

        {
            let connections = self.connections.lock().await;
            if let Some(conn) = connections.get(&publisher_id) {
                return Ok(conn.clone());
            }
        }

        let conn = Arc::new(
            PublisherConnection::new(self.endpoint.clone(), publisher_id, publisher_addr).await?,
        );

        self.connections
            .lock()
            .await
            .insert(publisher_id, conn.clone());

        Ok(conn)
    }

    pub async fn subscribe(
        &self,
        publisher_id: EndpointId,
        url_prefix: String,
    ) -> Result<()> {
        let conn = self.connect(publisher_id, None).await?;
        conn.subscribe(url_prefix).await
    }

    pub async fn request(
        &self,
        publisher_id: EndpointId,
        url: String,
        transport_mode: TransportMode,
        subscribe_intent: SubscribeIntent,
    ) -> Result<MediaId> {
        let conn = self.connect(publisher_id, None).await?;
        conn.request(url, transport_mode, subscribe_intent).await
    }

    pub async fn events(&self, publisher_id: &EndpointId) -> Result<tokio::sync::broadcast::Receiver<MediaEvent>> {
        let connections = self.connections.lock().await;
        let conn = connections
            .get(publisher_id)
            .ok_or_else(|| anyhow!("Not connected to publisher: {}", publisher_id))?;
        Ok(conn.events())
    }

    pub async fn connected_publishers(&self) -> Vec<EndpointId> {
        self.connections.lock().await.keys().copied().collect()
    }

    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down subscriber client");

        let mut connections = self.connections.lock().await;
        for (publisher_id, conn) in connections.drain() {
            if let Ok(conn) = Arc::try_unwrap(conn) {
                if let Err(e) = conn.close().await {
                    warn!("Error closing connection to {}: {}", publisher_id, e);
                }
            }
        }

        self.endpoint.close().await;
        info!("Subscriber client shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn client_creation_assigns_an_endpoint_id() {
        let config = SubscriberClientConfig::default();
        let client = SubscriberClient::new(config).await.unwrap();
        assert_eq!(client.endpoint_id().to_string().len(), 64);
    }

    #[tokio::test]
    async fn connected_publishers_starts_empty() {
        let config = SubscriberClientConfig::default();
        let client = SubscriberClient::new(config).await.unwrap();
        assert!(client.connected_publishers().await.is_empty());
    }
}
