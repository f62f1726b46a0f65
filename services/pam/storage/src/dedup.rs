//! Sliding-window duplicate suppression for inbound events

use crate::Clock;
use pam_wire::ContentHash;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Drops events whose content hash was already seen within the window
///
/// Entries are kept in arrival order alongside the lookup map, so expiry is a
/// pop from the front on every call and memory stays bounded by the number
/// of distinct events inside one window.
#[derive(Debug)]
pub struct DedupFilter {
    /// How long a hash suppresses repeats
    window: Duration,
    /// Hash -> first time seen
    seen: HashMap<ContentHash, Instant>,
    /// Same entries in arrival order, for eviction
    order: VecDeque<(ContentHash, Instant)>,
    /// Number of events suppressed so far
    dropped: u64,
    clock: Arc<dyn Clock>,
}

impl DedupFilter {
    /// Create a filter with the given window
    pub fn new(window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            window,
            seen: HashMap::new(),
            order: VecDeque::new(),
            dropped: 0,
            clock,
        }
    }

    /// Record the hash and return true if the event should be forwarded
    pub fn admit(&mut self, hash: ContentHash) -> bool {
        let now = self.clock.now();
        self.evict_expired(now);

        if self.seen.contains_key(&hash) {
            self.dropped += 1;
            debug!("Suppressed duplicate event {} (total {})", hash, self.dropped);
            return false;
        }

        self.seen.insert(hash, now);
        self.order.push_back((hash, now));
        true
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some(&(hash, seen_at)) = self.order.front() {
            if now.saturating_duration_since(seen_at) < self.window {
                break;
            }
            self.order.pop_front();
            self.seen.remove(&hash);
        }
    }

    /// Number of hashes currently tracked
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether no hashes are tracked
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Number of events suppressed
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Configured window
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Forget every tracked hash
    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;
    use pam_wire::{content_hash, EventType};
    use serde_json::json;

    fn hash(text: &str) -> ContentHash {
        content_hash(EventType::ChatComplete, &json!({ "content": text }))
    }

    #[test]
    fn test_duplicate_within_window_is_dropped() {
        let clock = Arc::new(ManualClock::new());
        let mut filter = DedupFilter::new(Duration::from_secs(5), clock.clone());

        assert!(filter.admit(hash("hello")));
        clock.advance(Duration::from_secs(1));
        assert!(!filter.admit(hash("hello")));
        assert_eq!(filter.dropped(), 1);
    }

    #[test]
    fn test_duplicate_after_window_is_forwarded() {
        let clock = Arc::new(ManualClock::new());
        let mut filter = DedupFilter::new(Duration::from_secs(5), clock.clone());

        assert!(filter.admit(hash("hello")));
        clock.advance(Duration::from_secs(6));
        assert!(filter.admit(hash("hello")));
        assert_eq!(filter.dropped(), 0);
    }

    #[test]
    fn test_window_is_measured_from_first_sighting() {
        let clock = Arc::new(ManualClock::new());
        let mut filter = DedupFilter::new(Duration::from_secs(5), clock.clone());

        assert!(filter.admit(hash("a")));
        clock.advance(Duration::from_secs(3));
        assert!(!filter.admit(hash("a")));
        clock.advance(Duration::from_secs(3));
        // 6s after the first sighting the entry has expired
        assert!(filter.admit(hash("a")));
    }

    #[test]
    fn test_distinct_events_pass() {
        let clock = Arc::new(ManualClock::new());
        let mut filter = DedupFilter::new(Duration::from_secs(5), clock);

        assert!(filter.admit(hash("a")));
        assert!(filter.admit(hash("b")));
        assert_eq!(filter.len(), 2);
    }

    #[test]
    fn test_map_does_not_grow_past_window() {
        let clock = Arc::new(ManualClock::new());
        let mut filter = DedupFilter::new(Duration::from_secs(5), clock.clone());

        for i in 0..1000 {
            assert!(filter.admit(hash(&format!("event-{}", i))));
            clock.advance(Duration::from_millis(100));
        }

        // 5s window at one event per 100ms
        assert!(filter.len() <= 51, "tracked {} hashes", filter.len());
    }
}
