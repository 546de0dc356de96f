//! Core identifier and enum types for the media wire protocol.
//!
//! Follows a newtype-per-identifier pattern, scaled up to the 64-bit object
//! coordinates this protocol addresses.

use serde::{Deserialize, Serialize};

/// A group identifier. Groups typically correspond to a GOP; `object_id`
/// resets to zero at every new group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub u64);

/// An object identifier, scoped to its enclosing group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

/// A byte offset within an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Offset(pub u64);

/// Identifies a media stream for datagram routing, assigned by ACCEPT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaId(pub u64);

impl GroupId {
    pub fn next(self) -> GroupId {
        GroupId(self.0 + 1)
    }
}

impl ObjectId {
    pub fn next(self) -> ObjectId {
        ObjectId(self.0 + 1)
    }
}

/// Composite object coordinate `(group_id, object_id)`.
///
/// `Ord` is derived field-order, which gives exactly the lexicographic
/// ordering required on `(group_id, object_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub group_id: GroupId,
    pub object_id: ObjectId,
}

impl ObjectKey {
    pub const fn new(group_id: u64, object_id: u64) -> Self {
        Self {
            group_id: GroupId(group_id),
            object_id: ObjectId(object_id),
        }
    }

    /// The coordinate of the next object within the same group.
    pub fn next_object(self) -> Self {
        Self {
            group_id: self.group_id,
            object_id: self.object_id.next(),
        }
    }

    /// The coordinate of object zero of the next group.
    pub fn next_group(self) -> Self {
        Self {
            group_id: self.group_id.next(),
            object_id: ObjectId(0),
        }
    }
}

/// Composite fragment coordinate `(group_id, object_id, offset)`.
///
/// `Ord` again falls out of derived field order, giving the lexicographic
/// ordering the datagram ACK tracker's ordered set relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FragmentKey {
    pub object: ObjectKey,
    pub offset: Offset,
}

impl FragmentKey {
    pub fn new(group_id: u64, object_id: u64, offset: u64) -> Self {
        Self {
            object: ObjectKey::new(group_id, object_id),
            offset: Offset(offset),
        }
    }

    pub fn group_id(self) -> GroupId {
        self.object.group_id
    }

    pub fn object_id(self) -> ObjectId {
        self.object.object_id
    }
}

/// One of the four delivery modes a subscriber may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportMode {
    SingleStream,
    Datagram,
    Warp,
    Rush,
}

/// What a REQUEST's subscriber is asking to start from.
///
/// When a request carries both `CurrentGroup` and an explicit start object,
/// the explicit coordinate wins (see SPEC_FULL.md §11) — callers encode that
/// precedence by constructing `StartPoint` directly rather than `CurrentGroup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscribeIntent {
    CurrentGroup,
    NextGroup,
    StartPoint(GroupId, ObjectId),
}

/// Whether the receiver should treat the sender's cache as authoritative
/// real-time state rather than a replayable archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachePolicy {
    Default,
    RealTime,
}

/// Sentinel flag values carried on FRAGMENT/OBJECT_HEADER/datagram headers.
pub mod flags {
    /// No special condition.
    pub const NONE: u8 = 0x00;
    /// Paired with `object_length == 0`: this object was skipped by the
    /// congestion evaluator and carries no body.
    pub const SKIPPED: u8 = 0xff;
}

/// Delivery mode of a completed object, passed to `object_ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectReadyMode {
    /// Delivered on first completion, immediately following its predecessor.
    InSequence,
    /// Delivered on completion but out of sequence.
    Peek,
    /// Re-delivered in sequence after a previous `Peek`.
    Repair,
}

/// Reason a stream or connection's consumer callback was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Unknown,
    Finished,
    RemoteApplication,
    QuicConnection,
    Internal,
    DeleteContext,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_ordering_is_lexicographic() {
        let a = ObjectKey::new(0, 5);
        let b = ObjectKey::new(1, 0);
        assert!(a < b);
    }

    #[test]
    fn fragment_key_ordering_is_lexicographic() {
        let a = FragmentKey::new(1, 2, 100);
        let b = FragmentKey::new(1, 2, 200);
        let c = FragmentKey::new(1, 3, 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn object_key_next_object_and_next_group() {
        let k = ObjectKey::new(3, 9);
        assert_eq!(k.next_object(), ObjectKey::new(3, 10));
        assert_eq!(k.next_group(), ObjectKey::new(4, 0));
    }
}
