//! Session-owned buffers for the PAM channel: windowed dedup and outbound queue.
//!
//! Both structures are plain owned values with no interior locking; the
//! session that owns them serializes access. Time is read through the
//! [`Clock`] trait so window eviction and queue aging are testable without
//! sleeping.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dedup;
pub mod queue;

use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, Instant};

/// Source of monotonic time
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant
    fn now(&self) -> Instant;
}

/// Clock backed by the Tokio timer, so paused test time applies
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// Manually advanced clock for tests
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    /// Start at the current instant
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

// Re-export main types
pub use dedup::DedupFilter;
pub use queue::{FlushOutcome, OutboundQueue, PendingMessage};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_secs(3));
        assert_eq!(clock.now() - start, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_clock_follows_paused_time() {
        let clock = SystemClock;
        let start = clock.now();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(clock.now() - start >= Duration::from_secs(10));
    }
}
