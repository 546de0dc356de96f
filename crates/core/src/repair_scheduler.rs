//! Repair scheduler, SPEC_FULL.md §5 / §4.4.
//!
//! A time-based sweep across every stream's [`AckTracker`] extra-repeat
//! FIFO: each tick, due entries are requeued as datagrams and the earliest
//! remaining `extra_repeat_time` across all streams becomes the scheduler's
//! next requested wake-up. Grounded on a `keepalive_task`-style
//! `tokio::select!` timer arm in `server/src/network/connection.rs`, which
//! this generalizes from a fixed interval to a data-driven `min()` wake.

use std::time::Instant;

use crate::ack_tracker::{AckTracker, RequeuedDatagram};
use crate::types::StreamHandle;

/// One datagram the scheduler wants requeued, tagged with the stream it
/// belongs to.
pub struct ScheduledRequeue {
    pub stream: StreamHandle,
    pub datagram: RequeuedDatagram,
}

/// Sweep every tracker's extra-repeat FIFO at `now`.
///
/// Returns the datagrams due for resend and the earliest future wake-up
/// time across all streams (`None` means no stream has anything pending,
/// i.e. "+infinity" — the outer loop should fall back to its other wake
/// sources).
pub fn sweep<'a>(
    trackers: impl IntoIterator<Item = (StreamHandle, &'a mut AckTracker)>,
    now: Instant,
) -> (Vec<ScheduledRequeue>, Option<Instant>) {
    let mut due = Vec::new();
    let mut next_wake: Option<Instant> = None;

    for (stream, tracker) in trackers {
        let (requeued, wake) = tracker.sweep_extra_repeats(now);
        due.extend(requeued.into_iter().map(|datagram| ScheduledRequeue {
            stream,
            datagram,
        }));
        next_wake = match (next_wake, wake) {
            (None, w) => w,
            (n, None) => n,
            (Some(a), Some(b)) => Some(a.min(b)),
        };
    }

    (due, next_wake)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ack_tracker::RepairConfig;
    use protocol::FragmentKey;
    use std::time::Duration;

    #[test]
    fn sweep_aggregates_across_streams_and_picks_earliest_wake() {
        let config = RepairConfig {
            extra_repeat_after_delayed: true,
            extra_repeat_delay: Duration::from_millis(5),
            ..Default::default()
        };
        let mut a = AckTracker::new(config);
        let mut b = AckTracker::new(config);

        a.on_first_transmission(
            FragmentKey::new(0, 0, 0),
            10,
            10,
            protocol::flags::NONE,
            25,
            0,
            vec![1; 10],
        );
        b.on_first_transmission(
            FragmentKey::new(0, 0, 0),
            10,
            10,
            protocol::flags::NONE,
            25,
            0,
            vec![2; 10],
        );

        let (due, wake) = sweep(
            [(StreamHandle(1), &mut a), (StreamHandle(2), &mut b)],
            Instant::now(),
        );
        assert!(due.is_empty());
        assert!(wake.is_some());

        let later = Instant::now() + Duration::from_millis(6);
        let (due, _) = sweep([(StreamHandle(1), &mut a), (StreamHandle(2), &mut b)], later);
        assert_eq!(due.len(), 2);
    }
}
