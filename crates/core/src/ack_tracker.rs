//! Datagram ACK tracker and repair engine, SPEC_FULL.md §4.4.
//!
//! Per bidirectional sender stream, tracks in-flight datagram fragments in
//! an ordered set keyed by `(group_id, object_id, offset)`, advances a
//! monotone horizon as acks arrive, and schedules "extra repeat" copies.
//!
//! Per SPEC_FULL.md §9's design note, the "ordered set + FIFO dual-linked
//! record" is modeled as two `BTreeMap`s keyed by the same `FragmentKey`
//! handle rather than one intrusive doubly-linked structure.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use protocol::{FragmentKey, GroupId, ObjectId};

/// Soft cap on a single queued datagram fragment, mirroring a typical QUIC
/// path MTU budget after header overhead.
pub const MAX_DATAGRAM_QUEUE_LENGTH: usize = 1200;

/// Horizon is compared "at or below" as uninitialized until the first
/// advance. Before that, nothing is considered already delivered — every
/// first transmission creates a tracking record.
#[derive(Debug, Clone, Copy)]
struct Horizon {
    initialized: bool,
    group_id: GroupId,
    object_id: ObjectId,
    offset: u64,
    is_last_fragment: bool,
}

impl Horizon {
    fn uninitialized() -> Self {
        Self {
            initialized: false,
            group_id: GroupId(0),
            object_id: ObjectId(0),
            offset: 0,
            is_last_fragment: true,
        }
    }

    fn at_or_below(&self, key: FragmentKey) -> bool {
        if !self.initialized {
            return false;
        }
        (key.group_id(), key.object_id(), key.offset.0)
            <= (self.group_id, self.object_id, self.offset)
    }
}

struct AckRecord {
    length: u64,
    object_length: u64,
    flags: u8,
    queue_delay_ms: u32,
    nb_objects_previous_group: u64,
    payload: Vec<u8>,
    start_time: Instant,
    last_sent_time: Instant,
    is_acked: bool,
    nack_received: bool,
    is_extra_queued: bool,
}

/// Behavior toggles for extra-repeat scheduling (SPEC_FULL.md §4.4).
#[derive(Debug, Clone, Copy)]
pub struct RepairConfig {
    pub extra_repeat_after_delayed: bool,
    pub extra_repeat_on_nack: bool,
    pub extra_repeat_delay: Duration,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            extra_repeat_after_delayed: false,
            extra_repeat_on_nack: false,
            extra_repeat_delay: Duration::from_millis(5),
        }
    }
}

/// Result of a first-transmission accounting call.
#[derive(Debug, PartialEq, Eq)]
pub enum TransmitOutcome {
    Inserted,
    /// Already at or below the horizon; counted as a duplicate, no record
    /// created.
    DuplicateBelowHorizon,
}

/// A datagram the repair engine wants requeued, carrying everything needed
/// to rebuild its wire header without consulting the tracker again.
pub struct RequeuedDatagram {
    pub key: FragmentKey,
    pub payload: Vec<u8>,
    pub queue_delay_ms: u32,
    pub object_length: u64,
    pub flags: u8,
    pub nb_objects_previous_group: u64,
}

pub struct AckTracker {
    records: BTreeMap<FragmentKey, AckRecord>,
    extra_repeat_queue: BTreeMap<(Instant, u64), FragmentKey>,
    extra_repeat_seq: u64,
    horizon: Horizon,
    below_horizon_count: u64,
    config: RepairConfig,
}

impl AckTracker {
    pub fn new(config: RepairConfig) -> Self {
        Self {
            records: BTreeMap::new(),
            extra_repeat_queue: BTreeMap::new(),
            extra_repeat_seq: 0,
            horizon: Horizon::uninitialized(),
            below_horizon_count: 0,
            config,
        }
    }

    pub fn below_horizon_count(&self) -> u64 {
        self.below_horizon_count
    }

    /// Account for the first transmission of a fragment.
    #[allow(clippy::too_many_arguments)]
    pub fn on_first_transmission(
        &mut self,
        key: FragmentKey,
        length: u64,
        object_length: u64,
        flags: u8,
        queue_delay_ms: u32,
        nb_objects_previous_group: u64,
        payload: Vec<u8>,
    ) -> TransmitOutcome {
        if self.horizon.at_or_below(key) {
            self.below_horizon_count += 1;
            return TransmitOutcome::DuplicateBelowHorizon;
        }

        let now = Instant::now();
        let extra_queue = self.config.extra_repeat_after_delayed
            && queue_delay_ms > 20
            && !self.config.extra_repeat_delay.is_zero();

        if extra_queue {
            self.schedule_extra_repeat(key, now);
        }

        self.records.insert(
            key,
            AckRecord {
                length,
                object_length,
                flags,
                queue_delay_ms,
                nb_objects_previous_group,
                payload,
                start_time: now,
                last_sent_time: now,
                is_acked: false,
                nack_received: false,
                is_extra_queued: extra_queue,
            },
        );

        TransmitOutcome::Inserted
    }

    /// Account for an ACK covering `(key, length)`. Advances the horizon
    /// when the ACKed record is contiguous with it.
    pub fn on_ack(&mut self, key: FragmentKey, _length: u64) {
        if self.horizon.at_or_below(key) {
            self.below_horizon_count += 1;
            return;
        }
        if let Some(record) = self.records.get_mut(&key) {
            record.is_acked = true;
        }
        self.advance_horizon();
    }

    /// Treated identically to an ACK: the fragment actually arrived.
    pub fn on_spurious_lost(&mut self, key: FragmentKey, length: u64) {
        self.on_ack(key, length);
    }

    /// Account for a loss reported at send-time `t_sent`. Returns the
    /// datagrams (possibly split) that must be requeued, or an empty vec if
    /// the record has already been retired through horizon advance.
    pub fn on_loss(&mut self, key: FragmentKey, t_sent: Instant) -> Vec<RequeuedDatagram> {
        let Some(record) = self.records.get_mut(&key) else {
            return Vec::new();
        };
        if record.is_acked || record.last_sent_time > t_sent + Duration::from_millis(1) {
            return Vec::new();
        }

        record.nack_received = true;
        let now = Instant::now();
        record.queue_delay_ms += now.duration_since(record.start_time).as_millis() as u32;
        record.last_sent_time = now;

        let pieces = split_payload(&record.payload, MAX_DATAGRAM_QUEUE_LENGTH);
        let queue_delay_ms = record.queue_delay_ms;

        if self.config.extra_repeat_on_nack {
            self.schedule_extra_repeat(key, now);
        }

        let object_length = record.object_length;
        let flags = record.flags;
        let nb_objects_previous_group = record.nb_objects_previous_group;

        let mut offset = key.offset.0;
        pieces
            .into_iter()
            .map(|piece| {
                let requeue_key = FragmentKey::new(key.group_id().0, key.object_id().0, offset);
                offset += piece.len() as u64;
                RequeuedDatagram {
                    key: requeue_key,
                    payload: piece,
                    queue_delay_ms,
                    object_length,
                    flags,
                    nb_objects_previous_group,
                }
            })
            .collect()
    }

    /// Flush every extra-repeat entry due at or before `now`; returns the
    /// datagrams to resend and the next wake-up time (`None` means no more
    /// entries are pending, i.e. "+infinity").
    pub fn sweep_extra_repeats(&mut self, now: Instant) -> (Vec<RequeuedDatagram>, Option<Instant>) {
        let mut due = Vec::new();
        loop {
            let Some((&(time, seq), &key)) = self.extra_repeat_queue.iter().next() else {
                break;
            };
            if time > now {
                break;
            }
            self.extra_repeat_queue.remove(&(time, seq));
            if let Some(record) = self.records.get_mut(&key) {
                record.is_extra_queued = false;
                due.push(RequeuedDatagram {
                    key,
                    payload: record.payload.clone(),
                    queue_delay_ms: record.queue_delay_ms,
                    object_length: record.object_length,
                    flags: record.flags,
                    nb_objects_previous_group: record.nb_objects_previous_group,
                });
            }
        }
        let next_wake = self.extra_repeat_queue.keys().next().map(|(t, _)| *t);
        (due, next_wake)
    }

    fn schedule_extra_repeat(&mut self, key: FragmentKey, now: Instant) {
        let fire_at = now + self.config.extra_repeat_delay;
        let seq = self.extra_repeat_seq;
        self.extra_repeat_seq += 1;
        self.extra_repeat_queue.insert((fire_at, seq), key);
    }

    fn advance_horizon(&mut self) {
        loop {
            let Some((&key, _)) = self.records.iter().next() else {
                break;
            };
            let record = self.records.get(&key).unwrap();
            if !record.is_acked {
                break;
            }

            let Some(new_horizon) = self.contiguous_advance(key, record) else {
                break;
            };

            self.horizon = new_horizon;
            self.dequeue(key);
            self.records.remove(&key);
        }
    }

    /// Determine whether `key`/`record` is contiguous with the current
    /// horizon per the three contiguity rules, and if so compute the
    /// resulting horizon.
    fn contiguous_advance(&self, key: FragmentKey, record: &AckRecord) -> Option<Horizon> {
        let h = &self.horizon;

        if !h.initialized {
            // First-ever advance: any acked record at the minimal key
            // becomes the seed horizon as long as it starts at offset 0.
            if key.offset.0 != 0 {
                return None;
            }
            let new_offset = record.length;
            return Some(Horizon {
                initialized: true,
                group_id: key.group_id(),
                object_id: key.object_id(),
                offset: new_offset,
                is_last_fragment: new_offset >= record.object_length,
            });
        }

        // Rule 1: same (g, o), node offset equals current horizon offset.
        if key.group_id() == h.group_id && key.object_id() == h.object_id && key.offset.0 == h.offset
        {
            let new_offset = h.offset + record.length;
            return Some(Horizon {
                initialized: true,
                group_id: h.group_id,
                object_id: h.object_id,
                offset: new_offset,
                is_last_fragment: new_offset >= record.object_length,
            });
        }

        // Rule 2: same group, next object.
        if h.is_last_fragment
            && key.group_id() == h.group_id
            && key.object_id().0 == h.object_id.0 + 1
            && key.offset.0 == 0
        {
            return Some(Horizon {
                initialized: true,
                group_id: h.group_id,
                object_id: key.object_id(),
                offset: record.length,
                is_last_fragment: record.length >= record.object_length,
            });
        }

        // Rule 3: next group.
        if h.is_last_fragment
            && key.group_id().0 == h.group_id.0 + 1
            && key.object_id().0 == 0
            && key.offset.0 == 0
            && record.nb_objects_previous_group == h.object_id.0 + 1
        {
            return Some(Horizon {
                initialized: true,
                group_id: key.group_id(),
                object_id: ObjectId(0),
                offset: record.length,
                is_last_fragment: record.length >= record.object_length,
            });
        }

        None
    }

    fn dequeue(&mut self, key: FragmentKey) {
        if let Some(record) = self.records.get(&key) {
            if record.is_extra_queued {
                let stale: Vec<(Instant, u64)> = self
                    .extra_repeat_queue
                    .iter()
                    .filter(|(_, k)| **k == key)
                    .map(|(t, _)| *t)
                    .collect();
                for t in stale {
                    self.extra_repeat_queue.remove(&t);
                }
            }
        }
    }
}

fn split_payload(payload: &[u8], max_len: usize) -> Vec<Vec<u8>> {
    if payload.is_empty() {
        return vec![Vec::new()];
    }
    payload.chunks(max_len).map(|c| c.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(g: u64, o: u64, off: u64) -> FragmentKey {
        FragmentKey::new(g, o, off)
    }

    #[test]
    fn first_transmission_below_uninitialized_horizon_still_inserts() {
        let mut tracker = AckTracker::new(RepairConfig::default());
        let outcome =
            tracker.on_first_transmission(key(0, 0, 0), 10, 10, protocol::flags::NONE, 0, 0, vec![0; 10]);
        assert_eq!(outcome, TransmitOutcome::Inserted);
    }

    #[test]
    fn ack_whole_object_advances_horizon_to_last_fragment() {
        let mut tracker = AckTracker::new(RepairConfig::default());
        tracker.on_first_transmission(key(0, 0, 0), 10, 10, protocol::flags::NONE, 0, 0, vec![0; 10]);
        tracker.on_ack(key(0, 0, 0), 10);
        assert!(tracker.horizon.initialized);
        assert!(tracker.horizon.is_last_fragment);
        assert_eq!(tracker.horizon.object_id, ObjectId(0));
    }

    #[test]
    fn duplicate_ack_below_horizon_is_counted_not_corrupting() {
        let mut tracker = AckTracker::new(RepairConfig::default());
        tracker.on_first_transmission(key(0, 0, 0), 10, 10, protocol::flags::NONE, 0, 0, vec![0; 10]);
        tracker.on_ack(key(0, 0, 0), 10);
        let before = tracker.below_horizon_count();
        tracker.on_ack(key(0, 0, 0), 10);
        assert_eq!(tracker.below_horizon_count(), before + 1);
    }

    #[test]
    fn horizon_advances_across_object_boundary() {
        let mut tracker = AckTracker::new(RepairConfig::default());
        tracker.on_first_transmission(key(0, 0, 0), 10, 10, protocol::flags::NONE, 0, 0, vec![0; 10]);
        tracker.on_first_transmission(key(0, 1, 0), 5, 5, protocol::flags::NONE, 0, 0, vec![0; 5]);
        tracker.on_ack(key(0, 0, 0), 10);
        tracker.on_ack(key(0, 1, 0), 5);
        assert_eq!(tracker.horizon.object_id, ObjectId(1));
        assert!(tracker.horizon.is_last_fragment);
    }

    #[test]
    fn horizon_advances_across_group_boundary_when_count_matches() {
        let mut tracker = AckTracker::new(RepairConfig::default());
        // group 0 has exactly 1 object (object 0).
        tracker.on_first_transmission(key(0, 0, 0), 10, 10, protocol::flags::NONE, 0, 0, vec![0; 10]);
        tracker.on_first_transmission(key(1, 0, 0), 4, 4, protocol::flags::NONE, 0, 1, vec![0; 4]);
        tracker.on_ack(key(0, 0, 0), 10);
        tracker.on_ack(key(1, 0, 0), 4);
        assert_eq!(tracker.horizon.group_id, GroupId(1));
        assert_eq!(tracker.horizon.object_id, ObjectId(0));
    }

    #[test]
    fn loss_requeues_with_refreshed_queue_delay() {
        let mut tracker = AckTracker::new(RepairConfig::default());
        let t0 = Instant::now();
        tracker.on_first_transmission(key(0, 0, 0), 10, 10, protocol::flags::NONE, 5, 0, vec![7; 10]);
        let requeued = tracker.on_loss(key(0, 0, 0), t0);
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].payload, vec![7; 10]);
    }

    #[test]
    fn extra_repeat_on_nack_schedules_future_wakeup() {
        let config = RepairConfig {
            extra_repeat_on_nack: true,
            extra_repeat_delay: Duration::from_millis(5),
            ..Default::default()
        };
        let mut tracker = AckTracker::new(config);
        let t0 = Instant::now();
        tracker.on_first_transmission(key(2, 3, 0), 10, 10, protocol::flags::NONE, 0, 0, vec![1; 10]);
        tracker.on_loss(key(2, 3, 0), t0);

        let (due_now, next_wake) = tracker.sweep_extra_repeats(Instant::now());
        assert!(due_now.is_empty());
        assert!(next_wake.is_some());

        let later = Instant::now() + Duration::from_millis(6);
        let (due_later, _) = tracker.sweep_extra_repeats(later);
        assert_eq!(due_later.len(), 1);
    }
}
