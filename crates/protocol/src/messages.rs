//! Protocol message envelope and payload enum (SPEC_FULL.md §4.1).
//!
//! Grounded on a `Message { version, payload }` envelope and a
//! single large `MessagePayload` enum grouping every message type the
//! protocol recognizes.

use serde::{Deserialize, Serialize};

use crate::types::{CachePolicy, GroupId, MediaId, ObjectId, SubscribeIntent, TransportMode};
use crate::version::{CURRENT_VERSION, ProtocolVersion};

/// Every control-channel message travels wrapped in this envelope so the
/// receiver can check protocol compatibility before interpreting the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub version: ProtocolVersion,
    pub payload: MessagePayload,
}

impl Message {
    /// Build a message stamped with this implementation's current version.
    pub fn new(payload: MessagePayload) -> Self {
        Self {
            version: CURRENT_VERSION,
            payload,
        }
    }
}

/// The finite set of control-channel message types (SPEC_FULL.md §4.1).
///
/// Datagrams are not included here — they use their own header, see
/// [`DatagramHeader`] and [`Datagram`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessagePayload {
    /// subscriber → publisher: "give me URL over this mode starting at this intent".
    Request {
        url: String,
        transport_mode: TransportMode,
        subscribe_intent: SubscribeIntent,
        media_id: MediaId,
    },
    /// publisher → relay: "I will push URL starting at (g,o) with this cache policy".
    Post {
        url: String,
        transport_mode: TransportMode,
        cache_policy: CachePolicy,
        group_id: GroupId,
        object_id: ObjectId,
    },
    /// relay → publisher: "go ahead; send with this media_id on datagrams".
    Accept {
        transport_mode: TransportMode,
        media_id: MediaId,
    },
    /// sender → receiver: "first object you will see is (g,o)".
    StartPoint { group_id: GroupId, object_id: ObjectId },
    /// sender → receiver: "no objects beyond (g,o)".
    FinDatagram { group_id: GroupId, object_id: ObjectId },
    /// sender → receiver: "treat cache as real-time".
    CachePolicy(CachePolicy),
    /// stream-mode fragment (single_stream transport mode).
    Fragment {
        group_id: GroupId,
        object_id: ObjectId,
        nb_objects_previous_group: u64,
        offset: u64,
        object_length: u64,
        flags: u8,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    /// subscriber → publisher: "notify me of every URL beginning with prefix".
    Subscribe { url_prefix: String },
    /// publisher → subscriber: "URL matches your prefix".
    Notify { url: String },
    /// head of a unidirectional stream: "this stream carries group g of media m".
    WarpHeader { media_id: MediaId, group_id: GroupId },
    /// head of an object within a warp/rush stream.
    ///
    /// `flags == flags::SKIPPED` together with `object_length == 0` signals a
    /// congestion-skipped object.
    ObjectHeader {
        object_id: ObjectId,
        nb_objects_previous_group: u64,
        flags: u8,
        object_length: u64,
    },
}

/// Datagram header. Datagrams are framed independently of control-channel
/// messages (they have no 2-byte length prefix — the QUIC datagram itself is
/// the framing unit).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DatagramHeader {
    pub media_id: MediaId,
    pub group_id: GroupId,
    pub object_id: ObjectId,
    pub offset: u64,
    /// Accumulated queueing delay in milliseconds; each relay hop adds to it.
    pub queue_delay_ms: u32,
    pub flags: u8,
    pub nb_objects_previous_group: u64,
    pub object_length: u64,
}

/// A complete datagram: header plus payload bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datagram {
    pub header: DatagramHeader,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}
