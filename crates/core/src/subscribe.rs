//! Subscribe/notify bookkeeping, SPEC_FULL.md §4.8.
//!
//! Grounded on `server/src/network/notification_aggregator.rs`'s
//! dedup-by-key aggregation idiom (a `HashMap` keyed by identity plus an
//! ordering `Vec`), adapted here from per-device dedup to per-URL `NOTIFY`
//! dedup against a URL prefix rather than a fixed device set.

use std::collections::{HashSet, VecDeque};
use tracing::debug;

pub use crate::types::StreamHandle;

struct Subscription {
    prefix: String,
    /// URLs already queued or sent, not yet re-queueable until explicitly
    /// cleared — suppresses duplicate NOTIFYs for the same URL while one is
    /// in flight.
    in_flight: HashSet<String>,
    queue: VecDeque<String>,
}

/// Tracks every `SUBSCRIBE` registered by peers on this connection and the
/// `NOTIFY` backlog each one owes.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: std::collections::HashMap<StreamHandle, Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a prefix subscription, seeding its NOTIFY queue with every
    /// already-published source that matches.
    pub fn subscribe(&mut self, handle: StreamHandle, prefix: String, existing_sources: &[String]) {
        let mut sub = Subscription {
            prefix,
            in_flight: HashSet::new(),
            queue: VecDeque::new(),
        };
        for url in existing_sources {
            if url.starts_with(&sub.prefix) {
                sub.in_flight.insert(url.clone());
                sub.queue.push_back(url.clone());
            }
        }
        debug!(
            "subscribed stream {:?} to prefix {:?}, {} pending notify",
            handle,
            sub.prefix,
            sub.queue.len()
        );
        self.subscriptions.insert(handle, sub);
    }

    pub fn unsubscribe(&mut self, handle: StreamHandle) {
        self.subscriptions.remove(&handle);
    }

    /// Called for every newly-published local source; enqueues a NOTIFY on
    /// every subscription whose prefix matches and which does not already
    /// have this URL in flight.
    pub fn on_new_source(&mut self, url: &str) {
        for sub in self.subscriptions.values_mut() {
            if url.starts_with(&sub.prefix) && !sub.in_flight.contains(url) {
                sub.in_flight.insert(url.to_string());
                sub.queue.push_back(url.to_string());
            }
        }
    }

    /// Pop the next NOTIFY this stream owes, if any. The URL stays marked
    /// in-flight until [`Self::notify_sent`] is called once the outbound
    /// message buffer has drained.
    pub fn next_pending(&mut self, handle: StreamHandle) -> Option<String> {
        self.subscriptions.get_mut(&handle)?.queue.pop_front()
    }

    pub fn has_pending(&self, handle: StreamHandle) -> bool {
        self.subscriptions
            .get(&handle)
            .is_some_and(|s| !s.queue.is_empty())
    }

    /// Mark `url` as delivered; it may be re-notified if republished later.
    pub fn notify_sent(&mut self, handle: StreamHandle, url: &str) {
        if let Some(sub) = self.subscriptions.get_mut(&handle) {
            sub.in_flight.remove(url);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_seeds_queue_with_matching_existing_sources() {
        let mut reg = SubscriptionRegistry::new();
        let existing = vec!["media/a".to_string(), "other/b".to_string()];
        reg.subscribe(StreamHandle(1), "media/".to_string(), &existing);

        assert_eq!(reg.next_pending(StreamHandle(1)), Some("media/a".to_string()));
        assert_eq!(reg.next_pending(StreamHandle(1)), None);
    }

    #[test]
    fn new_source_matching_prefix_is_notified() {
        let mut reg = SubscriptionRegistry::new();
        reg.subscribe(StreamHandle(1), "media/".to_string(), &[]);
        reg.on_new_source("media/c");
        reg.on_new_source("other/d");

        assert_eq!(reg.next_pending(StreamHandle(1)), Some("media/c".to_string()));
        assert_eq!(reg.next_pending(StreamHandle(1)), None);
    }

    #[test]
    fn duplicate_notify_suppressed_while_in_flight() {
        let mut reg = SubscriptionRegistry::new();
        reg.subscribe(StreamHandle(1), "media/".to_string(), &[]);
        reg.on_new_source("media/a");
        reg.on_new_source("media/a"); // duplicate while still in flight

        assert_eq!(reg.next_pending(StreamHandle(1)), Some("media/a".to_string()));
        assert_eq!(reg.next_pending(StreamHandle(1)), None);

        reg.notify_sent(StreamHandle(1), "media/a");
        reg.on_new_source("media/a"); // republished after delivery: allowed again
        assert_eq!(reg.next_pending(StreamHandle(1)), Some("media/a".to_string()));
    }

    #[test]
    fn seed_and_later_additions_preserve_order_no_duplicates() {
        let mut reg = SubscriptionRegistry::new();
        let existing = vec!["media/a".to_string(), "other/b".to_string()];
        reg.subscribe(StreamHandle(1), "media/".to_string(), &existing);
        reg.on_new_source("media/c");

        assert_eq!(reg.next_pending(StreamHandle(1)), Some("media/a".to_string()));
        assert_eq!(reg.next_pending(StreamHandle(1)), Some("media/c".to_string()));
        assert_eq!(reg.next_pending(StreamHandle(1)), None);
    }
}
