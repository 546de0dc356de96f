//! Connection lifecycle: owns every stream, the reassembly/ack-tracking
//! state that belongs to them, and the subscribe/notify registry for one
//! QUIC connection.
//!
//! Grounded on `server/src/network/connection.rs`'s `ClientConnection`
//! (field layout, `run()`'s `tokio::select!` accept-loop shape, per-stream
//! `handle_stream` dispatch) and `client/src/network/connection.rs`'s
//! `PublisherConnection` (the `Arc<Mutex<..>>` handle-sharing pattern and
//! `tokio::spawn`ed background listener this module generalizes into a
//! spawn-per-stream accept loop). Generalized here from one bidirectional
//! request/response stream per USB operation to a persistent control
//! stream plus any number of warp/rush unidirectional data streams and
//! unreliable datagrams.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use protocol::{GroupId, MediaId, Message, MessagePayload, ObjectId, TransportMode, validate_version};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, trace, warn};

use crate::ack_tracker::AckTracker;
use crate::congestion::{CongestionEvaluator, CongestionMode, PathSignals};
use crate::error::{CoreError, Result};
use crate::message_buffer::MessageBuffer;
use crate::quic::{QuicConnection, QuicRecvStream, QuicSendStream};
use crate::reassembly::{Delivery, Reassembler};
use crate::repair_scheduler;
use crate::source::{Fragment, SourceEvent, SourceHandle};
use crate::stream_state::{ControlStream, IncomingKind, SendAction, UniRecvStream, UniSendStream};
use crate::subscribe::SubscriptionRegistry;
use crate::types::StreamHandle;

/// Idle timeout after which a connection with no stream activity is torn
/// down.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(180);

/// How often a control stream re-checks its priority chain for newly
/// arrived work (a pending `Notify`, a repair sweep landing, a fragment
/// pulled off its source channel) when nothing forced a wakeup.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How often the repair scheduler re-sweeps every datagram-mode stream's
/// ack tracker for overdue retransmissions.
const REPAIR_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// Everything this connection knows about media it is actively receiving:
/// one [`Reassembler`] per media stream.
struct MediaState {
    reassembler: Reassembler,
}

/// State reachable from every task spawned off one connection. The accept
/// loop in [`Connection::run`] never blocks on a single stream, so anything
/// a stream-handling task touches has to live behind a shared lock instead
/// of on a `&mut self` receiver the way a single-threaded driver would hold
/// it.
struct Shared {
    next_handle: AtomicU64,
    next_media_id: AtomicU64,
    subscriptions: Mutex<SubscriptionRegistry>,
    published_urls: Mutex<HashSet<String>>,
    sources: Mutex<HashMap<String, mpsc::Receiver<SourceEvent>>>,
    media: Mutex<HashMap<MediaId, MediaState>>,
    ack_trackers: Mutex<HashMap<StreamHandle, AckTracker>>,
    /// Which media a datagram-mode control stream's ack tracker belongs to,
    /// so the repair sweep task can stamp a `DatagramHeader` for a
    /// retransmission without re-deriving it from the tracker.
    ack_stream_media: Mutex<HashMap<StreamHandle, MediaId>>,
    congestion: CongestionEvaluator,
}

impl Shared {
    fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(0),
            next_media_id: AtomicU64::new(0),
            subscriptions: Mutex::new(SubscriptionRegistry::new()),
            published_urls: Mutex::new(HashSet::new()),
            sources: Mutex::new(HashMap::new()),
            media: Mutex::new(HashMap::new()),
            ack_trackers: Mutex::new(HashMap::new()),
            ack_stream_media: Mutex::new(HashMap::new()),
            congestion: CongestionEvaluator::new(CongestionMode::None),
        }
    }

    fn allocate_handle(&self) -> StreamHandle {
        StreamHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn allocate_media_id(&self) -> MediaId {
        MediaId(self.next_media_id.fetch_add(1, Ordering::Relaxed))
    }

    async fn register_media(&self, media_id: MediaId) {
        self.media
            .lock()
            .await
            .entry(media_id)
            .or_insert_with(|| MediaState {
                reassembler: Reassembler::new(),
            });
    }

    fn deliver_fragment(
        media: &mut HashMap<MediaId, MediaState>,
        media_id: MediaId,
        group_id: GroupId,
        object_id: ObjectId,
        nb_objects_previous_group: u64,
        offset: u64,
        object_length: u64,
        flags: u8,
        data: Vec<u8>,
    ) -> Vec<Delivery> {
        match media.get_mut(&media_id) {
            Some(state) => state.reassembler.accept_fragment(
                group_id,
                object_id,
                offset,
                &data,
                object_length,
                nb_objects_previous_group,
                flags,
            ),
            None => {
                warn!("fragment for unregistered media {:?}", media_id);
                Vec::new()
            }
        }
    }
}

/// One QUIC connection's worth of protocol state, generic over the
/// transport seam so it can be driven against a fake in tests.
///
/// Cloning the handle (`Connection::new` returns an owned value, but every
/// accepted stream is handled by its own `tokio::spawn`ed task) shares the
/// same connection and state: `conn` and `shared` are both reference
/// counted so no stream handler ever needs `&mut Connection`.
pub struct Connection<Q: QuicConnection> {
    conn: Arc<Q>,
    shared: Arc<Shared>,
}

impl<Q: QuicConnection> Connection<Q> {
    pub fn new(conn: Q) -> Self {
        Self {
            conn: Arc::new(conn),
            shared: Arc::new(Shared::new()),
        }
    }

    /// Register a locally originated source under `url`, returning the
    /// channel its producer task should feed with [`SourceEvent`]s. A
    /// `Request` arriving for this URL takes the receiver end and drives it
    /// over whichever transport mode the subscriber asked for; only one
    /// subscriber per connection can be served per published URL, since the
    /// receiver can only be taken once (fan-out to multiple concurrent
    /// subscribers on the same connection is out of scope).
    pub async fn publish(&self, url: impl Into<String>) -> mpsc::Sender<SourceEvent> {
        let url = url.into();
        let (tx, rx) = mpsc::channel(64);
        self.shared.sources.lock().await.insert(url.clone(), rx);
        self.shared.published_urls.lock().await.insert(url.clone());
        self.shared.subscriptions.lock().await.on_new_source(&url);
        tx
    }

    /// Drive the connection until the peer closes it or an unrecoverable
    /// transport error occurs. Accepts bidirectional control streams,
    /// unidirectional warp/rush streams, and datagrams concurrently: each
    /// accepted stream is handed to its own task so one slow or
    /// long-lived stream (a control stream stays open for the connection's
    /// whole life) never blocks accepting the next one.
    pub async fn run(&self) -> Result<()> {
        let repair_shared = self.shared.clone();
        let repair_conn = self.conn.clone();
        let repair_task = tokio::spawn(async move {
            repair_sweep_loop(repair_conn, repair_shared).await;
        });

        let mut last_activity = Instant::now();

        loop {
            tokio::select! {
                bi = self.conn.accept_bi() => {
                    match bi {
                        Ok((send, recv)) => {
                            last_activity = Instant::now();
                            let handle = self.shared.allocate_handle();
                            let conn = self.conn.clone();
                            let shared = self.shared.clone();
                            tokio::spawn(async move {
                                if let Err(e) = run_control_stream(conn, shared, handle, send, recv).await {
                                    warn!("control stream {:?} failed: {:#}", handle, e);
                                }
                            });
                        }
                        Err(e) => {
                            debug!("connection closed while accepting bi stream: {:#}", e);
                            break;
                        }
                    }
                }

                uni = self.conn.accept_uni() => {
                    match uni {
                        Ok(recv) => {
                            last_activity = Instant::now();
                            let handle = self.shared.allocate_handle();
                            let shared = self.shared.clone();
                            tokio::spawn(async move {
                                if let Err(e) = run_uni_recv_stream(shared, handle, recv).await {
                                    warn!("uni stream {:?} failed: {:#}", handle, e);
                                }
                            });
                        }
                        Err(e) => {
                            debug!("connection closed while accepting uni stream: {:#}", e);
                            break;
                        }
                    }
                }

                datagram = self.conn.read_datagram() => {
                    match datagram {
                        Ok(payload) => {
                            last_activity = Instant::now();
                            let shared = self.shared.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_inbound_datagram(shared, &payload).await {
                                    warn!("datagram handling failed: {:#}", e);
                                }
                            });
                        }
                        Err(e) => {
                            debug!("connection closed while reading datagram: {:#}", e);
                            break;
                        }
                    }
                }
            }

            if last_activity.elapsed() > IDLE_TIMEOUT {
                warn!("connection idle for {:?}, closing", IDLE_TIMEOUT);
                break;
            }
        }

        repair_task.abort();
        self.conn.close(0, b"done");
        Ok(())
    }
}

/// Periodically sweep every datagram-mode stream's ack tracker for overdue
/// retransmissions and queue them for their owning control stream's next
/// tick, wired through `shared.ack_trackers` rather than held locally by
/// [`Connection::run`] so the sweep never competes with stream acceptance.
async fn repair_sweep_loop<Q: QuicConnection>(conn: Arc<Q>, shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(REPAIR_SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        let now = Instant::now();
        let mut trackers = shared.ack_trackers.lock().await;
        let (requeues, _next_wake) =
            repair_scheduler::sweep(trackers.iter_mut().map(|(h, t)| (*h, t)), now);
        drop(trackers);

        if requeues.is_empty() {
            continue;
        }

        let stream_media = shared.ack_stream_media.lock().await;
        for requeue in requeues {
            let media_id = match stream_media.get(&requeue.stream) {
                Some(id) => *id,
                None => continue,
            };
            let datagram = protocol::Datagram {
                header: protocol::DatagramHeader {
                    media_id,
                    group_id: requeue.datagram.key.object.group_id,
                    object_id: requeue.datagram.key.object.object_id,
                    offset: requeue.datagram.key.offset.0,
                    queue_delay_ms: requeue.datagram.queue_delay_ms,
                    flags: requeue.datagram.flags,
                    nb_objects_previous_group: requeue.datagram.nb_objects_previous_group,
                    object_length: requeue.datagram.object_length,
                },
                payload: requeue.datagram.payload,
            };
            if let Ok(bytes) = postcard::to_allocvec(&datagram) {
                let _ = conn.send_datagram(bytes::Bytes::from(bytes));
            }
        }
    }
}

/// Read the stream's opening message, validate and dispatch it, then keep
/// the stream alive for its whole life: every `POLL_INTERVAL` (or as soon
/// as a fresh inbound message arrives) it re-checks its priority chain for
/// outbound work, so a `Notify` queued after the opening handshake, a
/// single-stream fragment becoming available, or a due repair are all
/// still delivered without needing a second round trip from the peer.
async fn run_control_stream<Q: QuicConnection>(
    conn: Arc<Q>,
    shared: Arc<Shared>,
    handle: StreamHandle,
    mut send: Q::SendStream,
    mut recv: Q::RecvStream,
) -> Result<()> {
    let mut buf = MessageBuffer::new();
    let message = buf.read_message(&mut recv).await?;

    if let Err(e) = validate_version(&message.version) {
        warn!("rejecting control stream {:?}: {}", handle, e);
        send.reset(1);
        return Err(CoreError::ProtocolViolation(e.to_string()));
    }

    trace!("control stream {:?} opened with {:?}", handle, message.payload);

    let mut stream = ControlStream::new_receiver();
    let kind = classify(&message.payload).ok_or_else(|| {
        CoreError::ProtocolViolation(format!(
            "unexpected opening message on control stream: {:?}",
            message.payload
        ))
    })?;
    stream.receive_state = stream.validate_transition(kind)?;

    let mut fragment_rx: Option<mpsc::Receiver<Fragment>> = None;
    let mut pending_fragment: Option<Fragment> = None;

    match message.payload {
        MessagePayload::Subscribe { url_prefix } => {
            let existing: Vec<String> = shared.published_urls.lock().await.iter().cloned().collect();
            shared.subscriptions.lock().await.subscribe(handle, url_prefix, &existing);
        }
        MessagePayload::Request {
            url,
            transport_mode,
            media_id,
            subscribe_intent,
        } => {
            shared.register_media(media_id).await;
            stream.transport_mode = Some(transport_mode);
            stream.media_id = Some(media_id);

            // `CurrentGroup`/`NextGroup` have no fixed point to announce: the
            // subscriber simply receives whatever the source emits from here
            // on, which is `NextGroup`'s semantics by construction. Only an
            // explicit start point needs a reply on the control stream.
            if let protocol::SubscribeIntent::StartPoint(group_id, object_id) = subscribe_intent {
                stream.queue_start_point(group_id, object_id);
            }

            if transport_mode == TransportMode::Datagram {
                shared.ack_trackers.lock().await.insert(handle, AckTracker::new(Default::default()));
                shared.ack_stream_media.lock().await.insert(handle, media_id);
            }

            if let Some(rx) = shared.sources.lock().await.remove(&url) {
                match transport_mode {
                    TransportMode::SingleStream => {
                        let (fragment_tx, rx2) = mpsc::channel(64);
                        fragment_rx = Some(rx2);
                        let congestion = shared.congestion;
                        tokio::spawn(pump_source_to_channel(SourceHandle::new(rx), congestion, fragment_tx));
                    }
                    TransportMode::Datagram => {
                        let congestion = shared.congestion;
                        let conn = conn.clone();
                        let shared = shared.clone();
                        tokio::spawn(run_datagram_sender(conn, shared, handle, media_id, SourceHandle::new(rx), congestion));
                    }
                    TransportMode::Warp | TransportMode::Rush => {
                        let congestion = shared.congestion;
                        let conn = conn.clone();
                        let rush = transport_mode == TransportMode::Rush;
                        tokio::spawn(run_uni_sender(conn, media_id, SourceHandle::new(rx), congestion, rush));
                    }
                }
            }
        }
        MessagePayload::Post {
            url,
            transport_mode,
            group_id,
            object_id,
            ..
        } => {
            let media_id = shared.allocate_media_id();
            shared.register_media(media_id).await;
            shared.published_urls.lock().await.insert(url.clone());
            shared.subscriptions.lock().await.on_new_source(&url);
            stream.transport_mode = Some(transport_mode);
            stream.media_id = Some(media_id);
            stream.queue_accept(transport_mode, media_id);
            stream.queue_start_point(group_id, object_id);
        }
        _ => unreachable!("classify() only accepts opening-eligible payloads"),
    }

    stream.ready();

    // Read inbound messages on their own task and forward them over a
    // channel rather than racing `recv.read_exact` directly against the
    // poll ticker in the loop below: a `tokio::select!` that drops a
    // half-read length prefix on a losing branch would desync the framing,
    // and an `mpsc::Receiver::recv` has no such hazard.
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<Message>(8);
    tokio::spawn(async move {
        loop {
            match buf.read_message(&mut recv).await {
                Ok(message) => {
                    if inbound_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let mut recv_open = true;

    loop {
        tokio::select! {
            biased;

            message = inbound_rx.recv(), if recv_open => {
                match message {
                    Some(message) => {
                        if let Err(e) = handle_inbound_control_message(&mut stream, message) {
                            warn!("control stream {:?}: {}", handle, e);
                        }
                    }
                    None => {
                        recv_open = false;
                        stream.mark_peer_finished();
                    }
                }
            }

            _ = ticker.tick() => {}
        }

        if pending_fragment.is_none() {
            if let Some(rx) = fragment_rx.as_mut() {
                pending_fragment = rx.try_recv().ok();
            }
        }

        let repair_due = {
            let mut trackers = shared.ack_trackers.lock().await;
            trackers.get_mut(&handle).is_some_and(|t| {
                let (requeues, _) = repair_scheduler::sweep(std::iter::once((handle, &mut *t)), Instant::now());
                !requeues.is_empty()
            })
        };

        let pending_notify = shared.subscriptions.lock().await.next_pending(handle);
        let action = stream.next_send_action_with_repair(
            pending_fragment.is_some(),
            repair_due,
            pending_notify.as_deref(),
        );

        match action {
            SendAction::None => {
                if stream.is_finished() {
                    break;
                }
            }
            SendAction::Accept(mode, media_id) => {
                let msg = Message::new(MessagePayload::Accept { transport_mode: mode, media_id });
                buf.write_message(&mut send, &msg).await?;
                stream.mark_sent();
            }
            SendAction::StartPoint(group_id, object_id) => {
                let msg = Message::new(MessagePayload::StartPoint { group_id, object_id });
                buf.write_message(&mut send, &msg).await?;
                stream.mark_sent();
            }
            SendAction::FinalPoint(group_id, object_id) => {
                let msg = Message::new(MessagePayload::FinDatagram { group_id, object_id });
                buf.write_message(&mut send, &msg).await?;
                stream.mark_sent();
            }
            SendAction::CachePolicy(policy) => {
                let msg = Message::new(MessagePayload::CachePolicy(policy));
                buf.write_message(&mut send, &msg).await?;
                stream.mark_sent();
            }
            SendAction::StreamFragment | SendAction::RepairFragment => {
                if let Some(fragment) = pending_fragment.take() {
                    let msg = Message::new(MessagePayload::Fragment {
                        group_id: fragment.group_id,
                        object_id: fragment.object_id,
                        nb_objects_previous_group: fragment.nb_objects_previous_group,
                        offset: fragment.offset,
                        object_length: fragment.object_length,
                        flags: fragment.flags,
                        data: fragment.data,
                    });
                    buf.write_message(&mut send, &msg).await?;
                }
                stream.mark_sent();
            }
            SendAction::Notify(url) => {
                let msg = Message::new(MessagePayload::Notify { url: url.clone() });
                buf.write_message(&mut send, &msg).await?;
                shared.subscriptions.lock().await.notify_sent(handle, &url);
                stream.mark_sent();
                stream.finish_notify();
            }
            SendAction::Fin => {
                send.finish()?;
                stream.mark_sent();
            }
        }

        if stream.is_finished() && !recv_open {
            break;
        }
    }

    shared.ack_trackers.lock().await.remove(&handle);
    shared.ack_stream_media.lock().await.remove(&handle);
    shared.subscriptions.lock().await.unsubscribe(handle);
    Ok(())
}

/// Apply one inbound message to an already-opened control stream:
/// validate its transition and fold its contents into stream-local state.
/// The opening message is handled separately in [`run_control_stream`]
/// since it also decides what kind of stream this is.
fn handle_inbound_control_message(stream: &mut ControlStream, message: Message) -> Result<()> {
    let kind = classify(&message.payload)
        .ok_or_else(|| CoreError::ProtocolViolation(format!("unexpected message: {:?}", message.payload)))?;
    stream.receive_state = stream.validate_transition(kind)?;
    Ok(())
}

/// Classify an inbound [`MessagePayload`] for receive-transition
/// validation, independent of its contents.
fn classify(payload: &MessagePayload) -> Option<IncomingKind> {
    match payload {
        MessagePayload::Request { .. } => Some(IncomingKind::Request),
        MessagePayload::Post { .. } => Some(IncomingKind::Post),
        MessagePayload::Subscribe { .. } => Some(IncomingKind::Subscribe),
        MessagePayload::StartPoint { .. } => Some(IncomingKind::StartPoint),
        MessagePayload::FinDatagram { .. } => Some(IncomingKind::FinDatagram),
        MessagePayload::Fragment { .. } => Some(IncomingKind::Fragment),
        MessagePayload::CachePolicy(_) => Some(IncomingKind::CachePolicy),
        MessagePayload::Notify { .. } => Some(IncomingKind::Notify),
        _ => None,
    }
}

/// Feed a single-stream control stream's outbound queue from a local
/// source: the control stream task pulls from the receiving half via
/// `try_recv`, this task does the (potentially blocking-on-producer)
/// `next_fragment` await and pushes the result across.
async fn pump_source_to_channel(
    mut source: SourceHandle,
    congestion: CongestionEvaluator,
    tx: mpsc::Sender<Fragment>,
) {
    let signals = PathSignals {
        pacing_delay: Duration::from_millis(0),
        consumer_backlog: 0,
    };
    while let Some(fragment) = source.next_fragment(&congestion, signals).await {
        if tx.send(fragment).await.is_err() {
            break;
        }
    }
}

/// Drive a datagram-mode media source: pull fragments, frame each as a
/// [`protocol::Datagram`], send it unreliably, and record it with the
/// stream's [`AckTracker`] so the repair sweep can requeue it on loss.
async fn run_datagram_sender<Q: QuicConnection>(
    conn: Arc<Q>,
    shared: Arc<Shared>,
    handle: StreamHandle,
    media_id: MediaId,
    mut source: SourceHandle,
    congestion: CongestionEvaluator,
) {
    let signals = PathSignals {
        pacing_delay: Duration::from_millis(0),
        consumer_backlog: 0,
    };
    while let Some(fragment) = source.next_fragment(&congestion, signals).await {
        let header = protocol::DatagramHeader {
            media_id,
            group_id: fragment.group_id,
            object_id: fragment.object_id,
            offset: fragment.offset,
            queue_delay_ms: 0,
            flags: fragment.flags,
            nb_objects_previous_group: fragment.nb_objects_previous_group,
            object_length: fragment.object_length,
        };
        let datagram = protocol::Datagram {
            header,
            payload: fragment.data.clone(),
        };
        let Ok(bytes) = postcard::to_allocvec(&datagram) else {
            continue;
        };
        if conn.send_datagram(bytes::Bytes::from(bytes)).is_err() {
            break;
        }

        let key = protocol::FragmentKey::new(fragment.group_id.0, fragment.object_id.0, fragment.offset);
        let mut trackers = shared.ack_trackers.lock().await;
        if let Some(tracker) = trackers.get_mut(&handle) {
            tracker.on_first_transmission(
                key,
                fragment.data.len() as u64,
                fragment.object_length,
                fragment.flags,
                0,
                fragment.nb_objects_previous_group,
                fragment.data,
            );
        }
    }
}

/// Drive a warp (per-group stream) or rush (per-object stream) media
/// source: open a fresh unidirectional stream per group (warp) or per
/// object (rush), writing a `WarpHeader` once per stream followed by one
/// `ObjectHeader` + body per object.
async fn run_uni_sender<Q: QuicConnection>(
    conn: Arc<Q>,
    media_id: MediaId,
    mut source: SourceHandle,
    congestion: CongestionEvaluator,
    rush: bool,
) {
    let signals = PathSignals {
        pacing_delay: Duration::from_millis(0),
        consumer_backlog: 0,
    };

    // `UniSendStream` tracks the group/object bookkeeping; fragments are
    // accumulated into `object_buf` since `SourceHandle` may hand back an
    // object's bytes split across several events (mirroring the
    // single-stream/datagram `offset` framing) while `ObjectHeader` expects
    // one header immediately followed by the complete object body.
    let mut current: Option<(UniSendStream, Q::SendStream)> = None;
    let mut object_buf: Vec<u8> = Vec::new();

    while let Some(fragment) = source.next_fragment(&congestion, signals).await {
        let need_new_stream = match &current {
            None => true,
            Some((state, _)) => state.group_id != fragment.group_id || state.is_all_sent(),
        };

        if need_new_stream {
            if let Some((_, mut send)) = current.take() {
                let _ = send.finish();
            }
            let Ok(mut send) = conn.open_uni().await else {
                break;
            };
            let header = Message::new(MessagePayload::WarpHeader {
                media_id,
                group_id: fragment.group_id,
            });
            let Ok(framed) = protocol::encode_framed(&header) else {
                break;
            };
            if send.write_all(&framed).await.is_err() {
                break;
            }
            current = Some((UniSendStream::new(media_id, fragment.group_id, rush), send));
        }

        let is_skip = fragment.flags == protocol::flags::SKIPPED;
        object_buf.extend_from_slice(&fragment.data);
        let object_complete = is_skip || object_buf.len() as u64 >= fragment.object_length;
        if !object_complete {
            continue;
        }

        let Some((state, send)) = current.as_mut() else {
            break;
        };

        let object_header = Message::new(MessagePayload::ObjectHeader {
            object_id: fragment.object_id,
            nb_objects_previous_group: fragment.nb_objects_previous_group,
            flags: fragment.flags,
            object_length: fragment.object_length,
        });
        let Ok(framed) = protocol::encode_framed(&object_header) else {
            break;
        };
        if send.write_all(&framed).await.is_err() {
            break;
        }
        if !object_buf.is_empty() && send.write_all(&object_buf).await.is_err() {
            break;
        }
        object_buf.clear();
        state.advance_object();
    }

    if let Some((_, mut send)) = current {
        let _ = send.finish();
    }
}

/// Read one accepted unidirectional stream to completion: a `WarpHeader`
/// followed by any number of `ObjectHeader` + body pairs, delivered into
/// the owning media's reassembler.
async fn run_uni_recv_stream<Q: QuicConnection>(
    shared: Arc<Shared>,
    handle: StreamHandle,
    mut recv: Q::RecvStream,
) -> Result<()> {
    let mut buf = MessageBuffer::new();
    let message = buf.read_message(&mut recv).await?;
    let MessagePayload::WarpHeader { media_id, group_id } = message.payload else {
        return Err(CoreError::ProtocolViolation(
            "unidirectional stream did not open with WARP_HEADER".to_string(),
        ));
    };

    let mut recv_state = UniRecvStream::new(false);
    recv_state.on_warp_header(media_id, group_id)?;

    loop {
        let object_header = match buf.read_message(&mut recv).await {
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
            return Err(CoreError::ProtocolViolation(
                "expected OBJECT_HEADER within warp/rush stream".to_string(),
            ));
        };

        recv_state.on_object_header(object_id)?;

        let mut body = vec![0u8; object_length as usize];
        if object_length > 0 {
            recv.read_exact(&mut body).await?;
        }

        shared.register_media(media_id).await;
        let mut media = shared.media.lock().await;
        Shared::deliver_fragment(
            &mut media,
            media_id,
            group_id,
            object_id,
            nb_objects_previous_group,
            0,
            object_length,
            flags,
            body,
        );
        drop(media);

        recv_state.on_object_data_complete();
    }

    let _ = handle;
    Ok(())
}

async fn handle_inbound_datagram(shared: Arc<Shared>, payload: &[u8]) -> Result<()> {
    let datagram: protocol::Datagram =
        postcard::from_bytes(payload).map_err(|e| CoreError::MalformedMessage(e.to_string()))?;
    let header = datagram.header;

    shared.register_media(header.media_id).await;
    let mut media = shared.media.lock().await;
    Shared::deliver_fragment(
        &mut media,
        header.media_id,
        header.group_id,
        header.object_id,
        header.nb_objects_previous_group,
        header.offset,
        header.object_length,
        header.flags,
        datagram.payload,
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    struct FakeSend {
        out: Arc<StdMutex<Vec<u8>>>,
    }
    impl QuicSendStream for FakeSend {
        async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
            self.out.lock().unwrap().extend_from_slice(buf);
            Ok(())
        }
        fn finish(&mut self) -> Result<()> {
            Ok(())
        }
        fn reset(&mut self, _error_code: u32) {}
    }

    struct FakeRecv {
        chunks: VecDeque<u8>,
    }
    impl QuicRecvStream for FakeRecv {
        async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
            for slot in buf.iter_mut() {
                *slot = self
                    .chunks
                    .pop_front()
                    .ok_or_else(|| CoreError::Transport("eof".to_string()))?;
            }
            Ok(())
        }
        fn stop(&mut self, _error_code: u32) {}
    }

    struct Noop;
    impl QuicConnection for Noop {
        type SendStream = FakeSend;
        type RecvStream = FakeRecv;
        async fn open_bi(&self) -> Result<(FakeSend, FakeRecv)> {
            unreachable!()
        }
        async fn accept_bi(&self) -> Result<(FakeSend, FakeRecv)> {
            unreachable!()
        }
        async fn open_uni(&self) -> Result<FakeSend> {
            unreachable!()
        }
        async fn accept_uni(&self) -> Result<FakeRecv> {
            unreachable!()
        }
        fn send_datagram(&self, _payload: bytes::Bytes) -> Result<()> {
            Ok(())
        }
        async fn read_datagram(&self) -> Result<bytes::Bytes> {
            unreachable!()
        }
        fn close(&self, _error_code: u32, _reason: &[u8]) {}
    }

    #[test]
    fn allocate_handle_increments_monotonically() {
        let shared = Shared::new();
        let a = shared.allocate_handle();
        let b = shared.allocate_handle();
        assert_eq!(a, StreamHandle(0));
        assert_eq!(b, StreamHandle(1));
    }

    #[test]
    fn classify_rejects_reply_only_payloads() {
        let accept = MessagePayload::Accept {
            transport_mode: TransportMode::Datagram,
            media_id: MediaId(0),
        };
        assert!(classify(&accept).is_none());
    }

    #[tokio::test]
    async fn publish_then_request_dispatches_through_a_pump() {
        let conn = Connection::new(Noop);
        let tx = conn.publish("media/a").await;
        assert!(conn.shared.published_urls.lock().await.contains("media/a"));

        tx.send(SourceEvent {
            data: vec![1, 2, 3],
            is_new_group: true,
            object_length: 3,
            is_finished: true,
        })
        .await
        .unwrap();

        let rx = conn.shared.sources.lock().await.remove("media/a").unwrap();
        let (fragment_tx, mut fragment_rx) = mpsc::channel(4);
        let congestion = conn.shared.congestion;
        pump_source_to_channel(SourceHandle::new(rx), congestion, fragment_tx).await;

        let fragment = fragment_rx.recv().await.unwrap();
        assert_eq!(fragment.data, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn control_stream_round_trips_a_subscribe_and_notify() {
        let conn = Connection::new(Noop);
        let _tx = conn.publish("media/front").await;

        let subscribe = Message::new(MessagePayload::Subscribe {
            url_prefix: "media/".to_string(),
        });
        let recv = FakeRecv {
            chunks: protocol::encode_framed(&subscribe).unwrap().into_iter().collect(),
        };
        let out = Arc::new(StdMutex::new(Vec::new()));
        let send = FakeSend { out: out.clone() };

        let handle = conn.shared.allocate_handle();
        let shared = conn.shared.clone();
        let quic = conn.conn.clone();
        let task = tokio::spawn(async move {
            let _ = run_control_stream(quic, shared, handle, send, recv).await;
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        task.abort();

        let bytes = out.lock().unwrap().clone();
        assert!(!bytes.is_empty());
        let decoded = protocol::decode_framed(&bytes).unwrap();
        match decoded.payload {
            MessagePayload::Notify { url } => assert_eq!(url, "media/front"),
            other => panic!("expected Notify, got {:?}", other),
        }
    }
}
