//! Per-channel write buffer shared by the session and the writer task.
//!
//! The writer peeks the head, sends it, and only then pops it, so the head is
//! the frame in flight. When the channel is torn down the session detaches the
//! outbox and takes back every command frame still in it, the in-flight one
//! included; a frame the socket already accepted may therefore be sent again
//! on the next channel.

use pam_storage::PendingMessage;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

/// One item waiting for the writer
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum OutboxItem {
    /// Application command
    Frame(PendingMessage),
    /// Heartbeat probe
    Ping(String),
    /// Send a close frame and shut the sink
    Close,
}

#[derive(Debug, Default)]
struct OutboxState {
    items: VecDeque<OutboxItem>,
    detached: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Outbox {
    state: Mutex<OutboxState>,
    notify: Notify,
}

impl Outbox {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue a command frame; a detached outbox hands it back
    pub(crate) fn push_frame(&self, message: PendingMessage) -> Result<(), PendingMessage> {
        {
            let mut state = self.state.lock();
            if state.detached {
                return Err(message);
            }
            state.items.push_back(OutboxItem::Frame(message));
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Queue a heartbeat probe, returning false once detached
    pub(crate) fn push_ping(&self, frame: String) -> bool {
        {
            let mut state = self.state.lock();
            if state.detached {
                return false;
            }
            state.items.push_back(OutboxItem::Ping(frame));
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the head item without removing it
    pub(crate) async fn peek(&self) -> OutboxItem {
        loop {
            if let Some(item) = self.state.lock().items.front().cloned() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    /// Remove the head after it was written
    pub(crate) fn pop_sent(&self) {
        let mut state = self.state.lock();
        if !state.detached {
            state.items.pop_front();
        }
    }

    /// Stop accepting items and return the unsent command frames in order
    ///
    /// With `graceful` set, a close item is left for the writer.
    pub(crate) fn detach(&self, graceful: bool) -> Vec<PendingMessage> {
        let unsent = {
            let mut state = self.state.lock();
            state.detached = true;
            let unsent = state
                .items
                .drain(..)
                .filter_map(|item| match item {
                    OutboxItem::Frame(message) => Some(message),
                    _ => None,
                })
                .collect();
            if graceful {
                state.items.push_back(OutboxItem::Close);
            }
            unsent
        };
        self.notify.notify_one();
        unsent
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state.lock().items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn message(id: &str) -> PendingMessage {
        PendingMessage::new(id.to_string(), format!("{{\"id\":\"{}\"}}", id), Instant::now())
    }

    #[tokio::test]
    async fn test_peek_waits_for_push() {
        let outbox = std::sync::Arc::new(Outbox::new());
        let waiter = {
            let outbox = outbox.clone();
            tokio::spawn(async move { outbox.peek().await })
        };
        tokio::task::yield_now().await;
        outbox.push_ping("ping".to_string());
        assert_eq!(waiter.await.unwrap(), OutboxItem::Ping("ping".to_string()));
    }

    #[tokio::test]
    async fn test_pop_sent_removes_head() {
        let outbox = Outbox::new();
        outbox.push_frame(message("a")).unwrap();
        outbox.push_frame(message("b")).unwrap();

        match outbox.peek().await {
            OutboxItem::Frame(head) => assert_eq!(head.client_message_id, "a"),
            other => panic!("unexpected head {:?}", other),
        }
        outbox.pop_sent();
        match outbox.peek().await {
            OutboxItem::Frame(head) => assert_eq!(head.client_message_id, "b"),
            other => panic!("unexpected head {:?}", other),
        }
        assert_eq!(outbox.len(), 1);
    }

    #[test]
    fn test_detach_returns_unsent_frames_in_order() {
        let outbox = Outbox::new();
        outbox.push_frame(message("a")).unwrap();
        outbox.push_ping("ping".to_string());
        outbox.push_frame(message("b")).unwrap();

        let unsent = outbox.detach(false);
        let ids: Vec<_> = unsent.iter().map(|m| m.client_message_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(outbox.len(), 0);

        assert!(outbox.push_frame(message("c")).is_err());
        assert!(!outbox.push_ping("ping".to_string()));
    }

    #[tokio::test]
    async fn test_graceful_detach_leaves_close() {
        let outbox = Outbox::new();
        outbox.push_frame(message("a")).unwrap();
        assert_eq!(outbox.detach(true).len(), 1);
        assert_eq!(outbox.peek().await, OutboxItem::Close);

        // the head stays put once detached
        outbox.pop_sent();
        assert_eq!(outbox.len(), 1);
    }
}
