//! Reconnect backoff schedule.
//!
//! Delays come from a fixed ascending table; once the index runs past the end
//! the last entry repeats. A successful connect resets the index.

use std::time::Duration;

/// Backoff table used when none is configured: 1s, 2s, 4s, 8s, 16s
pub fn default_delays() -> Vec<Duration> {
    [1, 2, 4, 8, 16].into_iter().map(Duration::from_secs).collect()
}

/// Tracks consecutive failed attempts and the delay before the next one
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    /// Non-empty ascending delay table
    delays: Vec<Duration>,
    /// Consecutive failures since the last successful connect
    attempt_index: u32,
    /// Give up once this many retries have been scheduled
    max_attempts: Option<u32>,
}

impl RetrySchedule {
    /// Create a schedule; an empty table falls back to [`default_delays`]
    pub fn new(delays: Vec<Duration>, max_attempts: Option<u32>) -> Self {
        let delays = if delays.is_empty() {
            default_delays()
        } else {
            delays
        };
        Self {
            delays,
            attempt_index: 0,
            max_attempts,
        }
    }

    /// Delay before the next attempt, or `None` when retries are exhausted
    ///
    /// Advances the attempt index.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let delay = self.peek_delay();
        self.attempt_index += 1;
        Some(delay)
    }

    /// Delay the next call to [`next_delay`](Self::next_delay) would return
    pub fn peek_delay(&self) -> Duration {
        let last = self.delays.len() - 1;
        self.delays[(self.attempt_index as usize).min(last)]
    }

    /// Whether the retry budget is spent
    pub fn is_exhausted(&self) -> bool {
        matches!(self.max_attempts, Some(max) if self.attempt_index >= max)
    }

    /// Forget previous failures
    pub fn reset(&mut self) {
        self.attempt_index = 0;
    }

    /// Consecutive failures recorded
    pub fn attempt_index(&self) -> u32 {
        self.attempt_index
    }

    /// Configured retry budget
    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::new(default_delays(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_secs).collect()
    }

    #[test]
    fn test_delays_grow_then_hold() {
        let mut schedule = RetrySchedule::default();
        let observed: Vec<Duration> = (0..7).filter_map(|_| schedule.next_delay()).collect();
        assert_eq!(observed, secs(&[1, 2, 4, 8, 16, 16, 16]));
    }

    #[test]
    fn test_reset_starts_over() {
        let mut schedule = RetrySchedule::default();
        for _ in 0..4 {
            schedule.next_delay();
        }
        assert_eq!(schedule.attempt_index(), 4);
        assert_eq!(schedule.peek_delay(), Duration::from_secs(16));

        schedule.reset();
        assert_eq!(schedule.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_budget_exhaustion() {
        let mut schedule = RetrySchedule::new(secs(&[1, 2]), Some(3));
        assert_eq!(schedule.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(schedule.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(schedule.next_delay(), Some(Duration::from_secs(2)));
        assert!(schedule.is_exhausted());
        assert_eq!(schedule.next_delay(), None);
        assert_eq!(schedule.attempt_index(), 3);
    }

    #[test]
    fn test_empty_table_uses_defaults() {
        let mut schedule = RetrySchedule::new(Vec::new(), None);
        assert_eq!(schedule.next_delay(), Some(Duration::from_secs(1)));
    }
}
