//! Stream-level send/receive state machines, SPEC_FULL.md §4.5 / §4.6.
//!
//! Grounded on `server/src/network/connection.rs`'s `handle_stream`/
//! `handle_message` match-on-payload dispatch shape, generalized here from
//! one-bidirectional-stream-per-request to the persistent long-lived
//! control stream plus unidirectional warp/rush data streams this protocol
//! requires.

use protocol::{CachePolicy, GroupId, MediaId, ObjectId, TransportMode};

use crate::error::CoreError;

// ---------------------------------------------------------------------
// Bidirectional control stream (§4.5)
// ---------------------------------------------------------------------

/// Send-side state of a control stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Initial,
    Ready,
    /// Writing the stream's very first reply (currently only `Accept`, sent
    /// back for an inbound `Post`).
    SendingInitial,
    SendingStartPoint,
    SendingFinalPoint,
    SendingCachePolicy,
    SendingSingleStream,
    /// Re-sending a single-stream fragment whose bytes were already queued
    /// once (repair_scheduler driven retransmission), as distinct from the
    /// first send (`SendingSingleStream`) for ack-tracker bookkeeping.
    SendingRepair,
    SendingSubscribe,
    /// A `Notify` is queued but another higher-priority send is in flight or
    /// ahead of it in the priority chain; set as soon as the registry reports
    /// a pending URL, cleared once `next_send_action` actually emits it.
    WaitingNotify,
    SendingNotify,
    /// The `Notify` bytes are fully written; held here until the caller
    /// clears the subscription registry's in-flight bookkeeping and calls
    /// [`ControlStream::finish_notify`].
    NotifyReady,
    SendingFin,
    SendingNoMore,
}

/// Receive-side state of a control stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    NotYetReady,
    ReceiveInitial,
    ReceiveFragment,
    ReceiveNotify,
    ReceiveDone,
}

/// What the control stream wants to emit next. `next_send_action` returns
/// this; the caller is responsible for encoding it with `protocol::codec`
/// and draining it onto the QUIC stream, then calling the matching
/// `mark_*_sent` method.
#[derive(Debug, Clone, PartialEq)]
pub enum SendAction {
    None,
    Accept(TransportMode, MediaId),
    StartPoint(GroupId, ObjectId),
    FinalPoint(GroupId, ObjectId),
    CachePolicy(CachePolicy),
    /// Caller should pull the next fragment from the single-stream producer
    /// and frame it as `MessagePayload::Fragment`.
    StreamFragment,
    /// Caller should re-send a fragment the repair scheduler flagged as due
    /// for another copy, framed the same way as `StreamFragment`.
    RepairFragment,
    Notify(String),
    Fin,
}

/// One control (bidirectional) stream's combined state.
pub struct ControlStream {
    pub send_state: SendState,
    pub receive_state: ReceiveState,
    pub is_sender: bool,
    pub transport_mode: Option<TransportMode>,
    pub media_id: Option<MediaId>,

    is_accept_sent: bool,
    is_start_point_sent: bool,
    is_final_point_sent: bool,
    is_cache_policy_sent: bool,
    pending_accept: Option<(TransportMode, MediaId)>,
    pending_start_point: Option<(GroupId, ObjectId)>,
    pending_final_point: Option<(GroupId, ObjectId)>,
    pending_cache_policy: Option<CachePolicy>,

    is_local_finished: bool,
    is_peer_finished: bool,
}

impl ControlStream {
    /// A stream freshly created on the server side, awaiting the peer's
    /// opening message.
    pub fn new_receiver() -> Self {
        Self {
            send_state: SendState::Initial,
            receive_state: ReceiveState::ReceiveInitial,
            is_sender: false,
            transport_mode: None,
            media_id: None,
            is_accept_sent: false,
            is_start_point_sent: false,
            is_final_point_sent: false,
            is_cache_policy_sent: false,
            pending_accept: None,
            pending_start_point: None,
            pending_final_point: None,
            pending_cache_policy: None,
            is_local_finished: false,
            is_peer_finished: false,
        }
    }

    /// A stream the local side opens to issue a REQUEST/POST/SUBSCRIBE.
    pub fn new_sender() -> Self {
        Self {
            send_state: SendState::Ready,
            receive_state: ReceiveState::NotYetReady,
            is_sender: true,
            transport_mode: None,
            media_id: None,
            is_accept_sent: false,
            is_start_point_sent: false,
            is_final_point_sent: false,
            is_cache_policy_sent: false,
            pending_accept: None,
            pending_start_point: None,
            pending_final_point: None,
            pending_cache_policy: None,
            is_local_finished: false,
            is_peer_finished: false,
        }
    }

    /// Move a freshly constructed receiver stream out of `Initial` once its
    /// opening message has been dispatched, so `next_send_action` starts
    /// walking its priority chain instead of reporting nothing pending.
    pub fn ready(&mut self) {
        if matches!(self.send_state, SendState::Initial) {
            self.send_state = SendState::Ready;
        }
    }

    /// Queue the `Accept` reply sent back for an inbound `Post`.
    pub fn queue_accept(&mut self, transport_mode: TransportMode, media_id: MediaId) {
        self.pending_accept = Some((transport_mode, media_id));
    }

    pub fn queue_start_point(&mut self, group_id: GroupId, object_id: ObjectId) {
        self.pending_start_point = Some((group_id, object_id));
    }

    pub fn queue_final_point(&mut self, group_id: GroupId, object_id: ObjectId) {
        self.pending_final_point = Some((group_id, object_id));
    }

    pub fn queue_cache_policy(&mut self, policy: CachePolicy) {
        self.pending_cache_policy = Some(policy);
    }

    /// Priority chain for the `Ready` state (SPEC_FULL.md §4.5): unsent
    /// start_point → unsent final_point → unsent cache_policy → (for
    /// single-stream mode) stream data if the producer has bytes →
    /// subscribe pattern's NOTIFY queue → idle.
    pub fn next_send_action(&mut self, producer_has_bytes: bool, pending_notify: Option<&str>) -> SendAction {
        self.next_send_action_inner(producer_has_bytes, false, pending_notify)
    }

    /// Same priority chain as [`Self::next_send_action`], but lets the
    /// caller offer a due repair retransmission ahead of fresh single-stream
    /// data (both still rank below start_point/final_point/cache_policy).
    pub fn next_send_action_with_repair(
        &mut self,
        producer_has_bytes: bool,
        repair_due: bool,
        pending_notify: Option<&str>,
    ) -> SendAction {
        self.next_send_action_inner(producer_has_bytes, repair_due, pending_notify)
    }

    fn next_send_action_inner(
        &mut self,
        producer_has_bytes: bool,
        repair_due: bool,
        pending_notify: Option<&str>,
    ) -> SendAction {
        if pending_notify.is_some() && matches!(self.send_state, SendState::Ready) {
            self.send_state = SendState::WaitingNotify;
        }
        if !matches!(self.send_state, SendState::Ready | SendState::WaitingNotify) {
            return SendAction::None;
        }

        if !self.is_accept_sent {
            if let Some((mode, media_id)) = self.pending_accept {
                self.send_state = SendState::SendingInitial;
                return SendAction::Accept(mode, media_id);
            }
        }
        if !self.is_start_point_sent {
            if let Some((g, o)) = self.pending_start_point {
                self.send_state = SendState::SendingStartPoint;
                return SendAction::StartPoint(g, o);
            }
        }
        if !self.is_final_point_sent {
            if let Some((g, o)) = self.pending_final_point {
                self.send_state = SendState::SendingFinalPoint;
                return SendAction::FinalPoint(g, o);
            }
        }
        if !self.is_cache_policy_sent {
            if let Some(policy) = self.pending_cache_policy {
                self.send_state = SendState::SendingCachePolicy;
                return SendAction::CachePolicy(policy);
            }
        }
        if self.transport_mode == Some(TransportMode::SingleStream) && repair_due {
            self.send_state = SendState::SendingRepair;
            return SendAction::RepairFragment;
        }
        if self.transport_mode == Some(TransportMode::SingleStream) && producer_has_bytes {
            self.send_state = SendState::SendingSingleStream;
            return SendAction::StreamFragment;
        }
        if let Some(url) = pending_notify {
            self.send_state = SendState::SendingNotify;
            return SendAction::Notify(url.to_string());
        }
        if self.is_peer_finished && self.is_local_finished_pending() {
            self.send_state = SendState::SendingFin;
            return SendAction::Fin;
        }

        self.send_state = SendState::Ready;
        SendAction::None
    }

    fn is_local_finished_pending(&self) -> bool {
        !self.is_local_finished
    }

    /// Called once the outbound message buffer has fully drained.
    pub fn mark_sent(&mut self) {
        match self.send_state {
            SendState::SendingInitial => {
                self.is_accept_sent = true;
                self.pending_accept = None;
            }
            SendState::SendingStartPoint => self.is_start_point_sent = true,
            SendState::SendingFinalPoint => self.is_final_point_sent = true,
            SendState::SendingCachePolicy => self.is_cache_policy_sent = true,
            SendState::SendingNotify => {
                self.send_state = SendState::NotifyReady;
                return;
            }
            SendState::SendingFin => {
                self.is_local_finished = true;
                self.send_state = SendState::SendingNoMore;
                return;
            }
            _ => {}
        }
        self.send_state = SendState::Ready;
    }

    /// Called once the caller has cleared the subscription registry's
    /// in-flight bookkeeping for the `Notify` just sent via
    /// [`Self::mark_sent`]. Returns the stream to `Ready`.
    pub fn finish_notify(&mut self) {
        if matches!(self.send_state, SendState::NotifyReady) {
            self.send_state = SendState::Ready;
        }
    }

    pub fn mark_peer_finished(&mut self) {
        self.is_peer_finished = true;
    }

    /// A stream terminates once both directions have finished.
    pub fn is_finished(&self) -> bool {
        self.is_local_finished && self.is_peer_finished
    }

    /// Validate a receive-side transition per SPEC_FULL.md §4.5's table.
    /// Returns `Ok(new_state)` or `Err(ProtocolViolation)`.
    pub fn validate_transition(&self, incoming: IncomingKind) -> Result<ReceiveState, CoreError> {
        use IncomingKind::*;
        use ReceiveState::*;

        match (self.receive_state, incoming) {
            (ReceiveInitial, Request) => Ok(ReceiveDone),
            (ReceiveInitial, Post) => Ok(ReceiveDone),
            (ReceiveInitial, Subscribe) => Ok(ReceiveDone),
            (ReceiveFragment, StartPoint) if !self.is_start_point_sent => Ok(ReceiveFragment),
            (ReceiveFragment, FinDatagram) if !self.is_final_point_sent => Ok(ReceiveFragment),
            (ReceiveFragment, Fragment) => Ok(ReceiveFragment),
            (ReceiveFragment, CachePolicy) if !self.is_cache_policy_sent => Ok(ReceiveFragment),
            (ReceiveNotify, Notify) => Ok(ReceiveNotify),
            _ => Err(CoreError::ProtocolViolation(format!(
                "message {:?} illegal in receive state {:?}",
                incoming, self.receive_state
            ))),
        }
    }
}

/// Coarse classification of an inbound `MessagePayload` for transition
/// validation, independent of payload contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingKind {
    Request,
    Post,
    Subscribe,
    StartPoint,
    FinDatagram,
    Fragment,
    CachePolicy,
    Notify,
}

// ---------------------------------------------------------------------
// Unidirectional warp/rush data stream (§4.6)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniSendState {
    Open,
    WarpHeaderSent,
    SendingObjectHeader,
    SendingObjectData,
    AllSent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniReceiveState {
    Open,
    WarpHeaderReceived,
    ReceiveObjectHeader,
    ReceiveObjectData,
}

/// Sender-side state for one warp (per-group) or rush (per-object)
/// unidirectional stream.
pub struct UniSendStream {
    pub state: UniSendState,
    pub rush: bool,
    pub media_id: MediaId,
    pub group_id: GroupId,
    pub current_object_id: ObjectId,
    pub last_object_id: Option<ObjectId>,
}

impl UniSendStream {
    pub fn new(media_id: MediaId, group_id: GroupId, rush: bool) -> Self {
        Self {
            state: UniSendState::Open,
            rush,
            media_id,
            group_id,
            current_object_id: ObjectId(0),
            last_object_id: if rush { Some(ObjectId(1)) } else { None },
        }
    }

    /// Set once either the control stream's final point names this group,
    /// or the fragment cache reports a known object count.
    pub fn set_last_object_id(&mut self, last_object_id: ObjectId) {
        self.last_object_id = Some(last_object_id);
    }

    pub fn is_all_sent(&self) -> bool {
        matches!(self.last_object_id, Some(last) if self.current_object_id >= last)
    }

    /// Advance past one object (after its header/body, or after a
    /// congestion skip).
    pub fn advance_object(&mut self) {
        self.current_object_id = self.current_object_id.next();
        if self.is_all_sent() {
            self.state = UniSendState::AllSent;
        }
    }
}

/// Receiver-side state for one warp/rush unidirectional stream.
pub struct UniRecvStream {
    pub state: UniReceiveState,
    pub rush: bool,
    pub media_id: Option<MediaId>,
    pub group_id: Option<GroupId>,
    last_object_id: Option<ObjectId>,
}

impl UniRecvStream {
    pub fn new(rush: bool) -> Self {
        Self {
            state: UniReceiveState::Open,
            rush,
            media_id: None,
            group_id: None,
            last_object_id: None,
        }
    }

    pub fn on_warp_header(&mut self, media_id: MediaId, group_id: GroupId) -> Result<(), CoreError> {
        if self.state != UniReceiveState::Open {
            return Err(CoreError::ProtocolViolation(
                "WARP_HEADER seen after stream already advanced".to_string(),
            ));
        }
        self.media_id = Some(media_id);
        self.group_id = Some(group_id);
        self.state = UniReceiveState::WarpHeaderReceived;
        Ok(())
    }

    /// Validate the mid-stream invariant: warp increments `object_id` by
    /// exactly one between successive OBJECT_HEADERs; rush keeps it at
    /// zero.
    pub fn on_object_header(&mut self, object_id: ObjectId) -> Result<(), CoreError> {
        if matches!(self.state, UniReceiveState::Open) {
            return Err(CoreError::ProtocolViolation(
                "OBJECT_HEADER before WARP_HEADER".to_string(),
            ));
        }

        match self.last_object_id {
            None => {
                if self.rush && object_id != ObjectId(0) {
                    return Err(CoreError::ProtocolViolation(
                        "rush stream must start at object_id 0".to_string(),
                    ));
                }
            }
            Some(prev) => {
                let expected = if self.rush { ObjectId(0) } else { prev.next() };
                if object_id != expected {
                    return Err(CoreError::ProtocolViolation(format!(
                        "object_id {:?} is not contiguous with previous {:?}",
                        object_id, prev
                    )));
                }
            }
        }

        self.last_object_id = Some(object_id);
        self.state = UniReceiveState::ReceiveObjectData;
        Ok(())
    }

    pub fn on_object_data_complete(&mut self) {
        self.state = UniReceiveState::ReceiveObjectHeader;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_priority_favors_start_point_over_everything() {
        let mut s = ControlStream::new_sender();
        s.queue_start_point(GroupId(1), ObjectId(0));
        s.queue_final_point(GroupId(5), ObjectId(0));
        s.queue_cache_policy(CachePolicy::RealTime);

        let action = s.next_send_action(true, Some("media/a"));
        assert_eq!(action, SendAction::StartPoint(GroupId(1), ObjectId(0)));
    }

    #[test]
    fn after_start_point_sent_final_point_is_next() {
        let mut s = ControlStream::new_sender();
        s.queue_start_point(GroupId(1), ObjectId(0));
        s.queue_final_point(GroupId(5), ObjectId(0));

        let _ = s.next_send_action(false, None);
        s.mark_sent();
        let action = s.next_send_action(false, None);
        assert_eq!(action, SendAction::FinalPoint(GroupId(5), ObjectId(0)));
    }

    #[test]
    fn single_stream_data_yields_once_control_messages_are_drained() {
        let mut s = ControlStream::new_sender();
        s.transport_mode = Some(TransportMode::SingleStream);
        let action = s.next_send_action(true, None);
        assert_eq!(action, SendAction::StreamFragment);
    }

    #[test]
    fn notify_only_fires_when_nothing_higher_priority_pending() {
        let mut s = ControlStream::new_sender();
        let action = s.next_send_action(false, Some("media/a"));
        assert_eq!(action, SendAction::Notify("media/a".to_string()));
    }

    #[test]
    fn illegal_message_in_state_is_protocol_violation() {
        let s = ControlStream::new_receiver();
        let result = s.validate_transition(IncomingKind::Notify);
        assert!(matches!(result, Err(CoreError::ProtocolViolation(_))));
    }

    #[test]
    fn finishes_once_both_sides_finished() {
        let mut s = ControlStream::new_sender();
        assert!(!s.is_finished());
        s.mark_peer_finished();
        s.send_state = SendState::SendingFin;
        s.mark_sent();
        assert!(s.is_finished());
    }

    #[test]
    fn receiver_stream_is_inert_until_ready_is_called() {
        let mut s = ControlStream::new_receiver();
        assert_eq!(s.next_send_action(false, Some("media/a")), SendAction::None);
        s.ready();
        assert_eq!(
            s.next_send_action(false, Some("media/a")),
            SendAction::Notify("media/a".to_string())
        );
    }

    #[test]
    fn repair_due_outranks_fresh_single_stream_data() {
        let mut s = ControlStream::new_sender();
        s.transport_mode = Some(TransportMode::SingleStream);
        let action = s.next_send_action_with_repair(true, true, None);
        assert_eq!(action, SendAction::RepairFragment);
        assert_eq!(s.send_state, SendState::SendingRepair);
        s.mark_sent();
        assert_eq!(s.send_state, SendState::Ready);
    }

    #[test]
    fn warp_object_header_must_increment_by_one() {
        let mut recv = UniRecvStream::new(false);
        recv.on_warp_header(MediaId(1), GroupId(0)).unwrap();
        recv.on_object_header(ObjectId(0)).unwrap();
        recv.on_object_data_complete();
        recv.on_object_header(ObjectId(1)).unwrap();

        recv.on_object_data_complete();
        let err = recv.on_object_header(ObjectId(3));
        assert!(err.is_err());
    }

    #[test]
    fn rush_object_header_must_stay_at_zero() {
        let mut recv = UniRecvStream::new(true);
        recv.on_warp_header(MediaId(1), GroupId(0)).unwrap();
        recv.on_object_header(ObjectId(0)).unwrap();
        recv.on_object_data_complete();

        let err = recv.on_object_header(ObjectId(1));
        assert!(err.is_err());
    }

    #[test]
    fn sender_advances_and_detects_all_sent() {
        let mut send = UniSendStream::new(MediaId(1), GroupId(0), false);
        send.set_last_object_id(ObjectId(2));
        assert!(!send.is_all_sent());
        send.advance_object();
        assert!(!send.is_all_sent());
        send.advance_object();
        assert!(send.is_all_sent());
    }
}
