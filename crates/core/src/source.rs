//! Source/publisher integration, SPEC_FULL.md §2 item 8 / §6.
//!
//! Adapts a locally published media source's producer callback into the
//! fragmenting stream/datagram producer the wire protocol expects. The
//! producer callback contract (§6) is `publisher(action, ctx, buf, max_len)
//! -> (data_len, flags, is_new_group, object_length, is_finished,
//! is_still_active, should_skip)`; expressed here as a `tokio::sync::mpsc`
//! channel of [`SourceEvent`]s from the producer task rather than a
//! synchronous callback, matching the rest of this crate's async style and
//! the same producer/consumer channel-bridge idiom used between the network
//! layer and its device subsystem elsewhere in this workspace.

use protocol::{GroupId, ObjectId, flags};
use tokio::sync::mpsc;

use crate::congestion::{CongestionEvaluator, PathSignals};

/// One chunk of media data handed to the core by the producer task.
#[derive(Debug, Clone)]
pub struct SourceEvent {
    pub data: Vec<u8>,
    /// True on the first event of a new group; the handle bumps `group_id`
    /// and resets `object_id` to zero before framing this event.
    pub is_new_group: bool,
    /// Total length of the object this chunk belongs to.
    pub object_length: u64,
    /// True once the source has no more data to publish, ever.
    pub is_finished: bool,
}

/// One fragment ready to hand to the wire codec, framed as either a
/// `Fragment` (single-stream), an `ObjectHeader` + body (warp/rush), or a
/// `DatagramHeader` + payload (datagram mode) by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub group_id: GroupId,
    pub object_id: ObjectId,
    pub nb_objects_previous_group: u64,
    pub offset: u64,
    pub object_length: u64,
    pub flags: u8,
    pub data: Vec<u8>,
}

/// Handle to a locally published source: consumes [`SourceEvent`]s from the
/// producer task and turns them into fragments, applying group/object
/// bookkeeping and congestion-driven skip (§4.7).
pub struct SourceHandle {
    events: mpsc::Receiver<SourceEvent>,
    group_id: GroupId,
    object_id: ObjectId,
    objects_in_current_group: u64,
    nb_objects_previous_group: u64,
    offset_in_object: u64,
    finished: bool,
}

impl SourceHandle {
    pub fn new(events: mpsc::Receiver<SourceEvent>) -> Self {
        Self {
            events,
            group_id: GroupId(0),
            object_id: ObjectId(0),
            objects_in_current_group: 0,
            nb_objects_previous_group: 0,
            offset_in_object: 0,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Wait for the next producer event and turn it into a fragment,
    /// consulting `congestion` to decide whether to emit the skip sentinel
    /// (`flags = 0xff`, `object_length = 0`) instead of real bytes. Skipped
    /// objects are still numbered so the receiver can account for them.
    pub async fn next_fragment(
        &mut self,
        congestion: &CongestionEvaluator,
        signals: PathSignals,
    ) -> Option<Fragment> {
        if self.finished {
            return None;
        }
        let event = self.events.recv().await?;

        if event.is_new_group {
            self.nb_objects_previous_group = self.objects_in_current_group;
            self.group_id = self.group_id.next();
            self.object_id = ObjectId(0);
            self.objects_in_current_group = 0;
            self.offset_in_object = 0;
        }

        let skip = congestion.should_skip(signals);
        let fragment = if skip {
            Fragment {
                group_id: self.group_id,
                object_id: self.object_id,
                nb_objects_previous_group: self.nb_objects_previous_group,
                offset: 0,
                object_length: 0,
                flags: flags::SKIPPED,
                data: Vec::new(),
            }
        } else {
            let fragment = Fragment {
                group_id: self.group_id,
                object_id: self.object_id,
                nb_objects_previous_group: self.nb_objects_previous_group,
                offset: self.offset_in_object,
                object_length: event.object_length,
                flags: flags::NONE,
                data: event.data.clone(),
            };
            self.offset_in_object += event.data.len() as u64;
            fragment
        };

        if skip || self.offset_in_object >= event.object_length {
            self.objects_in_current_group += 1;
            self.object_id = self.object_id.next();
            self.offset_in_object = 0;
        }

        if event.is_finished {
            self.finished = true;
        }

        Some(fragment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion::CongestionMode;
    use std::time::Duration;

    fn no_congestion() -> (CongestionEvaluator, PathSignals) {
        (
            CongestionEvaluator::new(CongestionMode::None),
            PathSignals {
                pacing_delay: Duration::from_millis(0),
                consumer_backlog: 0,
            },
        )
    }

    #[tokio::test]
    async fn whole_object_in_one_event_advances_object_id() {
        let (tx, rx) = mpsc::channel(4);
        let mut source = SourceHandle::new(rx);
        let (congestion, signals) = no_congestion();

        tx.send(SourceEvent {
            data: vec![1, 2, 3],
            is_new_group: true,
            object_length: 3,
            is_finished: false,
        })
        .await
        .unwrap();

        let frag = source.next_fragment(&congestion, signals).await.unwrap();
        assert_eq!(frag.group_id, GroupId(1));
        assert_eq!(frag.object_id, ObjectId(0));
        assert_eq!(frag.data, vec![1, 2, 3]);

        tx.send(SourceEvent {
            data: vec![4, 5],
            is_new_group: false,
            object_length: 2,
            is_finished: false,
        })
        .await
        .unwrap();
        let frag2 = source.next_fragment(&congestion, signals).await.unwrap();
        assert_eq!(frag2.object_id, ObjectId(1));
    }

    #[tokio::test]
    async fn new_group_carries_previous_group_object_count() {
        let (tx, rx) = mpsc::channel(8);
        let mut source = SourceHandle::new(rx);
        let (congestion, signals) = no_congestion();

        for data in [vec![0u8], vec![1u8], vec![2u8]] {
            tx.send(SourceEvent {
                data,
                is_new_group: false,
                object_length: 1,
                is_finished: false,
            })
            .await
            .unwrap();
            source.next_fragment(&congestion, signals).await.unwrap();
        }

        tx.send(SourceEvent {
            data: vec![9u8],
            is_new_group: true,
            object_length: 1,
            is_finished: false,
        })
        .await
        .unwrap();
        let frag = source.next_fragment(&congestion, signals).await.unwrap();
        assert_eq!(frag.group_id, GroupId(1));
        assert_eq!(frag.nb_objects_previous_group, 3);
    }

    #[tokio::test]
    async fn congested_evaluator_emits_skip_sentinel() {
        let (tx, rx) = mpsc::channel(1);
        let mut source = SourceHandle::new(rx);
        let congestion = CongestionEvaluator::new(CongestionMode::Zero);
        let signals = PathSignals {
            pacing_delay: Duration::from_millis(0),
            consumer_backlog: 0,
        };

        tx.send(SourceEvent {
            data: vec![1, 2, 3],
            is_new_group: false,
            object_length: 3,
            is_finished: false,
        })
        .await
        .unwrap();

        let frag = source.next_fragment(&congestion, signals).await.unwrap();
        assert_eq!(frag.flags, flags::SKIPPED);
        assert_eq!(frag.object_length, 0);
        assert!(frag.data.is_empty());
    }

    #[tokio::test]
    async fn finished_event_marks_handle_finished() {
        let (tx, rx) = mpsc::channel(1);
        let mut source = SourceHandle::new(rx);
        let (congestion, signals) = no_congestion();

        tx.send(SourceEvent {
            data: vec![1],
            is_new_group: false,
            object_length: 1,
            is_finished: true,
        })
        .await
        .unwrap();

        source.next_fragment(&congestion, signals).await.unwrap();
        assert!(source.is_finished());
        assert!(source.next_fragment(&congestion, signals).await.is_none());
    }
}
