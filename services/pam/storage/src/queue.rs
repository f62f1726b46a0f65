//! Bounded FIFO of commands waiting for a live channel

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A serialized command waiting to be written
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    /// Client-generated id of the command
    pub client_message_id: String,
    /// Encoded frame
    pub payload: String,
    /// When the command was first queued
    pub enqueued_at: Instant,
    /// Times this message has been handed to a channel
    pub attempts: u32,
}

impl PendingMessage {
    /// Create a message that has not been attempted yet
    pub fn new(client_message_id: String, payload: String, enqueued_at: Instant) -> Self {
        Self {
            client_message_id,
            payload,
            enqueued_at,
            attempts: 0,
        }
    }
}

/// Result of a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Messages accepted by the writer
    pub sent: usize,
    /// Messages still queued
    pub remaining: usize,
    /// Whether the writer refused a message
    pub interrupted: bool,
}

/// FIFO buffer with a hard capacity and an optional age limit
///
/// Overflow drops the oldest entry rather than refusing the new one.
#[derive(Debug)]
pub struct OutboundQueue {
    items: VecDeque<PendingMessage>,
    capacity: usize,
    max_age: Option<Duration>,
    overflow_dropped: u64,
    expired_dropped: u64,
}

impl OutboundQueue {
    /// Create a queue; capacity is at least one
    pub fn new(capacity: usize, max_age: Option<Duration>) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
            max_age,
            overflow_dropped: 0,
            expired_dropped: 0,
        }
    }

    /// Append a message, returning the entry evicted to make room
    pub fn enqueue(&mut self, message: PendingMessage) -> Option<PendingMessage> {
        let mut evicted = None;
        while self.items.len() >= self.capacity {
            if let Some(oldest) = self.items.pop_front() {
                self.overflow_dropped += 1;
                warn!(
                    "Outbound queue full ({}), dropping oldest message {}",
                    self.capacity, oldest.client_message_id
                );
                evicted = Some(oldest);
            }
        }
        debug!(
            "Queued message {} ({} pending)",
            message.client_message_id,
            self.items.len() + 1
        );
        self.items.push_back(message);
        evicted
    }

    /// Put messages back at the head, keeping their relative order
    ///
    /// Capacity is not enforced here; the next `enqueue` trims the oldest.
    pub fn requeue_front(&mut self, messages: Vec<PendingMessage>) {
        for message in messages.into_iter().rev() {
            self.items.push_front(message);
        }
    }

    /// Drop entries older than the age limit
    pub fn expire(&mut self, now: Instant) -> usize {
        let Some(max_age) = self.max_age else {
            return 0;
        };

        let before = self.items.len();
        self.items
            .retain(|m| now.saturating_duration_since(m.enqueued_at) < max_age);
        let expired = before - self.items.len();
        if expired > 0 {
            self.expired_dropped += expired as u64;
            warn!("Dropped {} queued messages older than {:?}", expired, max_age);
        }
        expired
    }

    /// Hand messages to `write` in order until it refuses one
    ///
    /// A refused message is returned by `write` and goes back to the head,
    /// so nothing is lost on a partial flush.
    pub fn flush<F>(&mut self, mut write: F) -> FlushOutcome
    where
        F: FnMut(PendingMessage) -> Result<(), PendingMessage>,
    {
        let mut sent = 0;
        while let Some(mut message) = self.items.pop_front() {
            message.attempts += 1;
            if let Err(refused) = write(message) {
                self.items.push_front(refused);
                return FlushOutcome {
                    sent,
                    remaining: self.items.len(),
                    interrupted: true,
                };
            }
            sent += 1;
        }
        FlushOutcome {
            sent,
            remaining: 0,
            interrupted: false,
        }
    }

    /// Remove everything, returning how many messages were discarded
    pub fn clear(&mut self) -> usize {
        let count = self.items.len();
        self.items.clear();
        count
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Capacity limit
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages dropped because the queue was full
    pub fn overflow_dropped(&self) -> u64 {
        self.overflow_dropped
    }

    /// Messages dropped for exceeding the age limit
    pub fn expired_dropped(&self) -> u64 {
        self.expired_dropped
    }

    /// Iterate in queue order
    pub fn iter(&self) -> impl Iterator<Item = &PendingMessage> {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, at: Instant) -> PendingMessage {
        PendingMessage::new(id.to_string(), format!("{{\"id\":\"{}\"}}", id), at)
    }

    fn ids(queue: &OutboundQueue) -> Vec<String> {
        queue.iter().map(|m| m.client_message_id.clone()).collect()
    }

    #[test]
    fn test_flush_preserves_order() {
        let now = Instant::now();
        let mut queue = OutboundQueue::new(10, None);
        queue.enqueue(msg("a", now));
        queue.enqueue(msg("b", now));
        queue.enqueue(msg("c", now));

        let mut written = Vec::new();
        let outcome = queue.flush(|m| {
            written.push(m.client_message_id.clone());
            Ok(())
        });

        assert_eq!(written, vec!["a", "b", "c"]);
        assert_eq!(outcome.sent, 3);
        assert!(!outcome.interrupted);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_partial_flush_keeps_remainder_in_order() {
        let now = Instant::now();
        let mut queue = OutboundQueue::new(10, None);
        for id in ["a", "b", "c", "d"] {
            queue.enqueue(msg(id, now));
        }

        let mut accepted = 0;
        let outcome = queue.flush(|m| {
            if accepted == 2 {
                return Err(m);
            }
            accepted += 1;
            Ok(())
        });

        assert_eq!(outcome.sent, 2);
        assert_eq!(outcome.remaining, 2);
        assert!(outcome.interrupted);
        assert_eq!(ids(&queue), vec!["c", "d"]);
        // The refused message counts its attempt
        assert_eq!(queue.iter().next().unwrap().attempts, 1);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let now = Instant::now();
        let mut queue = OutboundQueue::new(2, None);
        assert!(queue.enqueue(msg("a", now)).is_none());
        assert!(queue.enqueue(msg("b", now)).is_none());

        let evicted = queue.enqueue(msg("c", now)).unwrap();
        assert_eq!(evicted.client_message_id, "a");
        assert_eq!(ids(&queue), vec!["b", "c"]);
        assert_eq!(queue.overflow_dropped(), 1);
    }

    #[test]
    fn test_requeue_front_keeps_relative_order() {
        let now = Instant::now();
        let mut queue = OutboundQueue::new(10, None);
        queue.enqueue(msg("c", now));
        queue.requeue_front(vec![msg("a", now), msg("b", now)]);

        assert_eq!(ids(&queue), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_expire_drops_stale_entries() {
        let start = Instant::now();
        let mut queue = OutboundQueue::new(10, Some(Duration::from_secs(60)));
        queue.enqueue(msg("old", start));
        queue.enqueue(msg("new", start + Duration::from_secs(50)));

        let expired = queue.expire(start + Duration::from_secs(70));
        assert_eq!(expired, 1);
        assert_eq!(ids(&queue), vec!["new"]);
        assert_eq!(queue.expired_dropped(), 1);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut queue = OutboundQueue::new(0, None);
        assert_eq!(queue.capacity(), 1);
        queue.enqueue(msg("a", Instant::now()));
        assert_eq!(queue.len(), 1);
    }
}
