//! Per-publisher connection handling.
//!
//! Manages a subscriber's connection to a single publisher or relay: opens
//! the persistent control stream carrying `REQUEST`/`SUBSCRIBE`, and
//! concurrently accepts the unidirectional warp/rush streams and
//! datagrams the publisher pushes in response. Grounded on a
//! `ServerConnection`-style shape (reconnect state machine with exponential
//! backoff, the `Arc<Mutex<Option<Connection>>>` handle-sharing pattern, the
//! spawned push-notification listener), generalized from one
//! request/response RPC per USB operation to a persistent control stream
//! plus any number of pushed data streams and datagrams.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use common::ALPN_PROTOCOL;
use iroh::{Endpoint, EndpointAddr, PublicKey as EndpointId};
use media_core::quic::iroh_adapter::IrohConnection;
use media_core::quic::{QuicConnection, QuicRecvStream, QuicSendStream};
use media_core::reassembly::{Delivery, Reassembler};
use protocol::{
    MediaId, Message, MessagePayload, SubscribeIntent, TransportMode, decode_message,
    encode_framed, validate_version,
};
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// An event delivered to the application for a subscribed or requested
/// media stream.
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// `NOTIFY(url)` pushed for a `SUBSCRIBE` prefix match.
    Notify { url: String },
    /// An object (or repair of a previously peeked object) is ready.
    ObjectReady {
        media_id: MediaId,
        delivery: Delivery,
    },
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

struct MediaState {
    reassembler: Reassembler,
}

/// One connection to a publisher or relay.
pub struct PublisherConnection {
    publisher_id: EndpointId,
    publisher_addr: Option<EndpointAddr>,
    endpoint: Endpoint,
    state: Arc<RwLock<ConnectionState>>,
    connection: Arc<Mutex<Option<IrohConnection>>>,
    shutdown: Arc<AtomicBool>,
    next_media_id: Arc<AtomicU64>,
    media: Arc<Mutex<HashMap<MediaId, MediaState>>>,
    events_tx: broadcast::Sender<MediaEvent>,
}

impl PublisherConnection {
    /// Establish a connection to a publisher and start the background
    /// listener for pushed warp/rush streams and datagrams.
    pub async fn new(
        endpoint: Endpoint,
        publisher_id: EndpointId,
        publisher_addr: Option<EndpointAddr>,
    ) -> Result<Self> {
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));
        let connection = Arc::new(Mutex::new(None));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (events_tx, _) = broadcast::channel(256);
        let media = Arc::new(Mutex::new(HashMap::new()));

        let conn = Self {
            publisher_id,
            publisher_addr,
            endpoint,
            state: state.clone(),
            connection: connection.clone(),
            shutdown: shutdown.clone(),
            next_media_id: Arc::new(AtomicU64::new(0)),
            media: media.clone(),
            events_tx: events_tx.clone(),
        };

        conn.connect().await?;

        tokio::spawn(run_push_listener(connection, media, events_tx, shutdown));

        Ok(conn)
    }

    async fn connect(&self) -> Result<()> {
        info!("Connecting to publisher: {}", self.publisher_id);
        *self.state.write().await = ConnectionState::Connecting;

        let conn = if let Some(ref addr) = self.publisher_addr {
            self.endpoint
                .connect(addr.clone(), ALPN_PROTOCOL)
                .await
                .context("Failed to connect to publisher")?
        } else {
            self.endpoint
                .connect(self.publisher_id, ALPN_PROTOCOL)
                .await
                .context("Failed to connect to publisher")?
        };

        info!("Connected to publisher: {}", self.publisher_id);
        *self.connection.lock().await = Some(IrohConnection(conn));
        *self.state.write().await = ConnectionState::Connected;
        Ok(())
    }

    /// Reconnect with exponential backoff (1s, doubling, capped at 30s).
    pub async fn reconnect(&self) -> Result<()> {
        let mut backoff_ms = 1000;
        let max_backoff_ms = 30_000;

        *self.state.write().await = ConnectionState::Reconnecting;

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(anyhow!("connection closed during reconnect"));
            }

            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "Reconnection to {} failed: {}. Retrying in {}ms",
                        self.publisher_id, e, backoff_ms
                    );
                    sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(max_backoff_ms);
                }
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    pub fn publisher_id(&self) -> EndpointId {
        self.publisher_id
    }

    /// Subscribe to all [`MediaEvent`]s this connection produces.
    pub fn events(&self) -> broadcast::Receiver<MediaEvent> {
        self.events_tx.subscribe()
    }

    /// Issue `SUBSCRIBE(prefix)` on a fresh control stream and let it run
    /// for the lifetime of the connection, forwarding `NOTIFY`s to
    /// [`MediaEvent::Notify`].
    pub async fn subscribe(&self, url_prefix: String) -> Result<()> {
        let conn = self.current_connection().await?;
        let (mut send, mut recv) = conn.open_bi().await.map_err(|e| anyhow!("{e}"))?;

        let message = Message::new(MessagePayload::Subscribe {
            url_prefix: url_prefix.clone(),
        });
        write_message(&mut send, &message).await?;

        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            loop {
                match read_message(&mut recv).await {
                    Ok(msg) => {
                        if let MessagePayload::Notify { url } = msg.payload {
                            let _ = events_tx.send(MediaEvent::Notify { url });
                        } else {
                            warn!("unexpected message on subscribe stream: {:?}", msg.payload);
                        }
                    }
                    Err(e) => {
                        debug!("subscribe stream for '{}' closed: {:#}", url_prefix, e);
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Issue `REQUEST(url, mode, intent)` for a fresh media identifier,
    /// register a reassembler for it, and (for `single_stream` mode) spawn
    /// a task that pulls `FRAGMENT`s directly off the control stream.
    /// Warp/rush/datagram delivery arrives via the shared push listener.
    pub async fn request(
        &self,
        url: String,
        transport_mode: TransportMode,
        subscribe_intent: SubscribeIntent,
    ) -> Result<MediaId> {
        let media_id = MediaId(self.next_media_id.fetch_add(1, Ordering::Relaxed));

        self.media.lock().await.insert(
            media_id,
            MediaState {
                reassembler: Reassembler::new(),
            },
        );

        let conn = self.current_connection().await?;
        let (mut send, mut recv) = conn.open_bi().await.map_err(|e| anyhow!("{e}"))?;

        let message = Message::new(MessagePayload::Request {
            url: url.clone(),
            transport_mode,
            subscribe_intent,
            media_id,
        });
        write_message(&mut send, &message).await?;

        if transport_mode == TransportMode::SingleStream {
            let media = self.media.clone();
            let events_tx = self.events_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = drain_control_stream(&mut recv, media_id, media, events_tx).await {
                    debug!("control stream for media {:?} ended: {:#}", media_id, e);
                }
            });
        }

        Ok(media_id)
    }

    async fn current_connection(&self) -> Result<IrohConnection> {
        self.connection
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow!("not connected to publisher: {}", self.publisher_id))
    }

    /// Close the connection to this publisher.
    pub async fn close(self) -> Result<()> {
        info!("Closing connection to publisher: {}", self.publisher_id);
        self.shutdown.store(true, Ordering::Relaxed);
        *self.state.write().await = ConnectionState::Closed;

        if let Some(conn) = self.connection.lock().await.take() {
            conn.close(0, b"subscriber shutdown");
        }
        Ok(())
    }
}

/// Read `START_POINT`/`FIN_DATAGRAM`/`CACHE_POLICY`/`FRAGMENT` messages
/// pushed back on a single-stream mode's control stream and feed completed
/// objects into the connection's event stream.
async fn drain_control_stream<R: QuicRecvStream>(
    recv: &mut R,
    media_id: MediaId,
    media: Arc<Mutex<HashMap<MediaId, MediaState>>>,
    events_tx: broadcast::Sender<MediaEvent>,
) -> Result<()> {
    loop {
        let message = read_message(recv).await?;
        match message.payload {
            MessagePayload::Fragment {
                group_id,
                object_id,
                nb_objects_previous_group,
                offset,
                object_length,
                flags,
                data,
            } => {
                let mut media = media.lock().await;
                if let Some(state) = media.get_mut(&media_id) {
                    let deliveries = state.reassembler.accept_fragment(
                        group_id,
                        object_id,
                        offset,
                        &data,
                        object_length,
                        nb_objects_previous_group,
                        flags,
                    );
                    for delivery in deliveries {
                        let _ = events_tx.send(MediaEvent::ObjectReady { media_id, delivery });
                    }
                }
            }
            MessagePayload::StartPoint {
                group_id,
                object_id,
            } => {
                let mut media = media.lock().await;
                if let Some(state) = media.get_mut(&media_id) {
                    state.reassembler.learn_start_point(group_id, object_id);
                }
            }
            MessagePayload::FinDatagram {
                group_id,
                object_id,
            } => {
                let mut media = media.lock().await;
                if let Some(state) = media.get_mut(&media_id) {
                    state.reassembler.learn_final_object_id(group_id, object_id);
                }
            }
            MessagePayload::CachePolicy(_) => {}
            other => {
                warn!(
                    "unexpected message on single-stream control stream: {:?}",
                    other
                );
            }
        }
    }
}

/// Accept and dispatch the warp/rush streams and datagrams a publisher
/// pushes for any of this connection's requested media, reconnecting on
/// transport loss. Grounded on `media_core::connection::Connection::run`'s
/// accept loop, specialized to the subscriber's always-initiator role (no
/// `accept_bi`: control streams are opened by us, never by the publisher).
async fn run_push_listener(
    connection: Arc<Mutex<Option<IrohConnection>>>,
    media: Arc<Mutex<HashMap<MediaId, MediaState>>>,
    events_tx: broadcast::Sender<MediaEvent>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        let conn = { connection.lock().await.clone() };
        let Some(conn) = conn else {
            sleep(Duration::from_millis(100)).await;
            continue;
        };

        tokio::select! {
            uni = conn.accept_uni() => {
                match uni {
                    Ok(recv) => {
                        let media = media.clone();
                        let events_tx = events_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_uni_stream(recv, media, events_tx).await {
                                warn!("warp/rush stream failed: {:#}", e);
                            }
                        });
                    }
                    Err(e) => {
                        debug!("uni stream accept error: {:#}", e);
                        sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            datagram = conn.read_datagram() => {
                match datagram {
                    Ok(payload) => {
                        if let Err(e) = handle_datagram(&payload, &media, &events_tx).await {
                            warn!("datagram handling failed: {:#}", e);
                        }
                    }
                    Err(e) => {
                        debug!("datagram read error: {:#}", e);
                        sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}

async fn handle_uni_stream<R: QuicRecvStream>(
    mut recv: R,
    media: Arc<Mutex<HashMap<MediaId, MediaState>>>,
    events_tx: broadcast::Sender<MediaEvent>,
) -> Result<()> {
    let header = read_message(&mut recv).await?;
    let MessagePayload::WarpHeader { media_id, group_id } = header.payload else {
        return Err(anyhow!(
            "unidirectional stream did not open with WARP_HEADER"
        ));
    };

    loop {
        let object_header = match read_message(&mut recv).await {
            Ok(msg) => msg,
            Err(_) => break,
        };
        let MessagePayload::ObjectHeader {
            object_id,
            nb_objects_previous_group,
            flags,
            object_length,
        } = object_header.payload
        else {
            return Err(anyhow!("expected OBJECT_HEADER within warp/rush stream"));
        };

        let mut body = vec![0u8; object_length as usize];
        if object_length > 0 {
            recv.read_exact(&mut body)
                .await
                .map_err(|e| anyhow!("{e}"))?;
        }

        let mut guard = media.lock().await;
        if let Some(state) = guard.get_mut(&media_id) {
            let deliveries = state.reassembler.accept_fragment(
                group_id,
                object_id,
                0,
                &body,
                object_length,
                nb_objects_previous_group,
                flags,
            );
            for delivery in deliveries {
                let _ = events_tx.send(MediaEvent::ObjectReady { media_id, delivery });
            }
        } else {
            warn!("warp stream data for unrequested media {:?}", media_id);
        }
    }

    Ok(())
}

async fn handle_datagram(
    payload: &[u8],
    media: &Arc<Mutex<HashMap<MediaId, MediaState>>>,
    events_tx: &broadcast::Sender<MediaEvent>,
) -> Result<()> {
    let datagram: protocol::Datagram =
        postcard::from_bytes(payload).map_err(|e| anyhow!("malformed datagram: {e}"))?;
    let header = datagram.header;

    let mut guard = media.lock().await;
    if let Some(state) = guard.get_mut(&header.media_id) {
        let deliveries = state.reassembler.accept_fragment(
            header.group_id,
            header.object_id,
            header.offset,
            &datagram.payload,
            header.object_length,
            header.nb_objects_previous_group,
            header.flags,
        );
        for delivery in deliveries {
            let _ = events_tx.send(MediaEvent::ObjectReady {
                media_id: header.media_id,
                delivery,
            });
        }
    }
    Ok(())
}

async fn read_message<R: QuicRecvStream>(recv: &mut R) -> Result<Message> {
    let mut len_buf = [0u8; 2];
    recv.read_exact(&mut len_buf)
        .await
        .map_err(|e| anyhow!("{e}"))?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    recv.read_exact(&mut body).await.map_err(|e| anyhow!("{e}"))?;
    let message = decode_message(&body).map_err(|e| anyhow!("{e}"))?;
    validate_version(&message.version).map_err(|e| anyhow!("{e}"))?;
    Ok(message)
}

async fn write_message<S: QuicSendStream>(send: &mut S, message: &Message) -> Result<()> {
    let framed = encode_framed(message).map_err(|e| anyhow!("{e}"))?;
    send.write_all(&framed).await.map_err(|e| anyhow!("{e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_state_equality() {
        assert_eq!(
            ConnectionState::Disconnected,
            ConnectionState::Disconnected
        );
        assert_ne!(ConnectionState::Connected, ConnectionState::Disconnected);
    }

    #[test]
    fn media_id_allocation_is_monotonic() {
        let counter = AtomicU64::new(0);
        let a = MediaId(counter.fetch_add(1, Ordering::Relaxed));
        let b = MediaId(counter.fetch_add(1, Ordering::Relaxed));
        assert_eq!(a, MediaId(0));
        assert_eq!(b, MediaId(1));
    }
}
