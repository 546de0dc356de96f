//! Fragment reassembly (consumer side), SPEC_FULL.md §4.3.
//!
//! Accepts `(group, object, offset, data)` fragments in any order, merges
//! byte ranges per object, and emits completed objects to the application in
//! one of three modes: `in_sequence`, `peek`, or `repair`. No teacher
//! analog — grounded on the fragment/object accounting in
//! `examples/original_source/lib/quicrq.c`'s stream and datagram receive
//! paths, described in SPEC_FULL.md §4.3/§4.4, adapted to an owned
//! `BTreeMap` of handles rather than the source's linked records.

use std::collections::BTreeMap;

use protocol::{GroupId, ObjectId, ObjectKey, ObjectReadyMode};

/// One contiguous received byte range, half-open `[start, end)`.
type Range = (u64, u64);

struct ObjectAssembly {
    ranges: Vec<Range>,
    data: Vec<u8>,
    object_length: Option<u64>,
    nb_objects_previous_group: Option<u64>,
    flags: u8,
    /// Set once the object has been delivered at least once (peek or
    /// in_sequence). A peeked object stays here so it can be re-delivered
    /// as `repair` once the sequence catches up.
    delivered_as_peek: bool,
    complete: bool,
}

impl ObjectAssembly {
    fn new() -> Self {
        Self {
            ranges: Vec::new(),
            data: Vec::new(),
            object_length: None,
            nb_objects_previous_group: None,
            flags: protocol::flags::NONE,
            delivered_as_peek: false,
            complete: false,
        }
    }

    /// Merge a fragment's bytes into this object's buffer, return true if
    /// the object just became complete.
    fn absorb(&mut self, offset: u64, bytes: &[u8], object_length: u64, flags: u8) -> bool {
        if self.complete {
            return false;
        }
        self.object_length = Some(object_length);
        self.flags = flags;

        let end = offset + bytes.len() as u64;
        if self.data.len() < end as usize {
            self.data.resize(end as usize, 0);
        }
        self.data[offset as usize..end as usize].copy_from_slice(bytes);
        insert_range(&mut self.ranges, (offset, end));

        let covers_whole = self.ranges.len() == 1
            && self.ranges[0].0 == 0
            && self.ranges[0].1 >= object_length;
        // `object_length == 0` (the congestion-skip sentinel) is vacuously
        // complete: the empty range `[0, 0)` covers it.
        let skipped_empty = object_length == 0;

        if covers_whole || skipped_empty {
            self.data.truncate(object_length as usize);
            self.complete = true;
        }
        self.complete
    }
}

/// Insert `new_range` into `ranges` (kept sorted, non-overlapping, merged).
fn insert_range(ranges: &mut Vec<Range>, new_range: Range) {
    ranges.push(new_range);
    ranges.sort_unstable_by_key(|r| r.0);
    let mut merged: Vec<Range> = Vec::with_capacity(ranges.len());
    for &(start, end) in ranges.iter() {
        if let Some(last) = merged.last_mut() {
            if start <= last.1 {
                last.1 = last.1.max(end);
                continue;
            }
        }
        merged.push((start, end));
    }
    *ranges = merged;
}

/// One completed object ready for delivery to the application.
pub struct Delivery {
    pub key: ObjectKey,
    pub mode: ObjectReadyMode,
    pub data: Vec<u8>,
    pub flags: u8,
}

/// Per-subscription reassembly state.
pub struct Reassembler {
    objects: BTreeMap<ObjectKey, ObjectAssembly>,
    /// Lengths of completed groups, learned from `nb_objects_previous_group`
    /// carried on the first object of the following group.
    group_lengths: BTreeMap<GroupId, u64>,
    next_expected: ObjectKey,
    start_point: Option<ObjectKey>,
    final_point: Option<ObjectKey>,
    last_delivered_in_sequence: Option<ObjectKey>,
    finished: bool,
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            objects: BTreeMap::new(),
            group_lengths: BTreeMap::new(),
            next_expected: ObjectKey::new(0, 0),
            start_point: None,
            final_point: None,
            last_delivered_in_sequence: None,
            finished: false,
        }
    }

    /// Announce the first object the receiver will ever see; anything
    /// earlier is spurious.
    pub fn learn_start_point(&mut self, group_id: GroupId, object_id: ObjectId) {
        let key = ObjectKey {
            group_id,
            object_id,
        };
        self.start_point = Some(key);
        if self.last_delivered_in_sequence.is_none() {
            self.next_expected = key;
        }
    }

    /// Announce that there is no object at or beyond `(group_id, object_id)`.
    pub fn learn_final_object_id(&mut self, group_id: GroupId, object_id: ObjectId) {
        self.final_point = Some(ObjectKey {
            group_id,
            object_id,
        });
        self.maybe_finish();
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Accept one fragment; returns every object delivery this fragment
    /// triggers (zero, one, or several via cascading repair deliveries).
    pub fn accept_fragment(
        &mut self,
        group_id: GroupId,
        object_id: ObjectId,
        offset: u64,
        data: &[u8],
        object_length: u64,
        nb_objects_previous_group: u64,
        flags: u8,
    ) -> Vec<Delivery> {
        let key = ObjectKey {
            group_id,
            object_id,
        };

        if let Some(start) = self.start_point {
            if key < start {
                return Vec::new();
            }
        }

        if object_id == ObjectId(0) && group_id.0 > 0 {
            self.group_lengths
                .entry(GroupId(group_id.0 - 1))
                .or_insert(nb_objects_previous_group);
        }

        let assembly = self.objects.entry(key).or_insert_with(ObjectAssembly::new);
        let just_completed = assembly.absorb(offset, data, object_length, flags);

        let mut out = Vec::new();
        if just_completed {
            self.deliver_completed(key, &mut out);
        }
        out
    }

    fn deliver_completed(&mut self, key: ObjectKey, out: &mut Vec<Delivery>) {
        if key == self.next_expected {
            self.emit(key, ObjectReadyMode::InSequence, out);
            self.advance_and_cascade(out);
        } else if let Some(assembly) = self.objects.get_mut(&key) {
            assembly.delivered_as_peek = true;
            out.push(Delivery {
                key,
                mode: ObjectReadyMode::Peek,
                data: assembly.data.clone(),
                flags: assembly.flags,
            });
        }
    }

    fn emit(&mut self, key: ObjectKey, mode: ObjectReadyMode, out: &mut Vec<Delivery>) {
        if let Some(assembly) = self.objects.get(&key) {
            out.push(Delivery {
                key,
                mode,
                data: assembly.data.clone(),
                flags: assembly.flags,
            });
        }
        self.last_delivered_in_sequence = Some(key);
    }

    fn advance_and_cascade(&mut self, out: &mut Vec<Delivery>) {
        loop {
            self.next_expected = self.next_coordinate(self.next_expected);
            self.maybe_finish();

            let Some(assembly) = self.objects.get(&self.next_expected) else {
                break;
            };
            if !assembly.complete {
                break;
            }
            if assembly.delivered_as_peek {
                self.emit(self.next_expected, ObjectReadyMode::Repair, out);
                continue;
            }
            // Completed but never peeked: becomes the new in-sequence
            // delivery directly.
            self.emit(self.next_expected, ObjectReadyMode::InSequence, out);
        }
    }

    /// The coordinate immediately after `key`, crossing into the next group
    /// only once that group's length is known.
    fn next_coordinate(&self, key: ObjectKey) -> ObjectKey {
        if let Some(&len) = self.group_lengths.get(&key.group_id) {
            if key.object_id.0 + 1 >= len {
                return key.next_group();
            }
        }
        key.next_object()
    }

    fn maybe_finish(&mut self) {
        if let (Some(final_point), Some(last)) = (self.final_point, self.last_delivered_in_sequence)
        {
            if last >= final_point {
                self.finished = true;
            }
        }
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_whole_objects_deliver_in_sequence() {
        let mut r = Reassembler::new();
        let d = r.accept_fragment(GroupId(0), ObjectId(0), 0, b"hello", 5, 0, protocol::flags::NONE);
        assert_eq!(d.len(), 1);
        assert!(matches!(d[0].mode, ObjectReadyMode::InSequence));
        assert_eq!(d[0].data, b"hello");
    }

    #[test]
    fn out_of_order_completion_is_peek_then_repair() {
        let mut r = Reassembler::new();

        // object 1 completes before object 0 arrives.
        let d1 = r.accept_fragment(GroupId(0), ObjectId(1), 0, b"two", 3, 0, protocol::flags::NONE);
        assert_eq!(d1.len(), 1);
        assert!(matches!(d1[0].mode, ObjectReadyMode::Peek));

        let d0 = r.accept_fragment(GroupId(0), ObjectId(0), 0, b"one", 3, 0, protocol::flags::NONE);
        // object 0 delivers in_sequence, cascades into repairing object 1.
        assert_eq!(d0.len(), 2);
        assert!(matches!(d0[0].mode, ObjectReadyMode::InSequence));
        assert_eq!(d0[0].data, b"one");
        assert!(matches!(d0[1].mode, ObjectReadyMode::Repair));
        assert_eq!(d0[1].data, b"two");
    }

    #[test]
    fn split_fragments_merge_into_one_object() {
        let mut r = Reassembler::new();
        let first = r.accept_fragment(GroupId(0), ObjectId(0), 0, b"AAAA", 8, 0, protocol::flags::NONE);
        assert!(first.is_empty());
        let second = r.accept_fragment(GroupId(0), ObjectId(0), 4, b"BBBB", 8, 0, protocol::flags::NONE);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].data, b"AAAABBBB");
    }

    #[test]
    fn crosses_group_boundary_once_length_known() {
        let mut r = Reassembler::new();
        // Group 0 has a single object (object 0).
        let d0 = r.accept_fragment(GroupId(0), ObjectId(0), 0, b"g0o0", 4, 0, protocol::flags::NONE);
        assert_eq!(d0.len(), 1);

        // Next group's first object tells us group 0 had exactly 1 object.
        let d1 = r.accept_fragment(GroupId(1), ObjectId(0), 0, b"g1o0", 4, 1, protocol::flags::NONE);
        assert_eq!(d1.len(), 1);
        assert!(matches!(d1[0].mode, ObjectReadyMode::InSequence));
    }

    #[test]
    fn start_point_discards_earlier_fragments() {
        let mut r = Reassembler::new();
        r.learn_start_point(GroupId(2), ObjectId(0));

        let spurious = r.accept_fragment(GroupId(1), ObjectId(5), 0, b"late", 4, 0, protocol::flags::NONE);
        assert!(spurious.is_empty());

        let accepted = r.accept_fragment(GroupId(2), ObjectId(0), 0, b"g2o0", 4, 0, protocol::flags::NONE);
        assert_eq!(accepted.len(), 1);
    }

    #[test]
    fn final_point_marks_finished_after_in_sequence_delivery() {
        let mut r = Reassembler::new();
        r.learn_final_object_id(GroupId(0), ObjectId(0));
        assert!(!r.is_finished());

        r.accept_fragment(GroupId(0), ObjectId(0), 0, b"only", 4, 0, protocol::flags::NONE);
        assert!(r.is_finished());
    }

    #[test]
    fn skipped_object_completes_with_empty_body() {
        let mut r = Reassembler::new();
        let d = r.accept_fragment(
            GroupId(0),
            ObjectId(0),
            0,
            &[],
            0,
            0,
            protocol::flags::SKIPPED,
        );
        assert_eq!(d.len(), 1);
        assert!(d[0].data.is_empty());
        assert_eq!(d[0].flags, protocol::flags::SKIPPED);
    }
}
