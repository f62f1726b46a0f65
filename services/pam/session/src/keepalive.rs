//! Heartbeat bookkeeping with RTT measurement.
//!
//! The session sends an application-level ping every interval and checks for
//! an answer after the pong timeout. Each unanswered ping counts as a miss;
//! enough consecutive misses declare the channel dead. Any pong, transport or
//! application level, resets the count.

use chrono::{DateTime, Utc};
use pam_wire::{encode_ping, WireError};
use std::time::{Duration, Instant};

/// Encode the ping frame for a correlation id
pub fn build_ping(corr_id: u64, timestamp: DateTime<Utc>) -> Result<String, WireError> {
    encode_ping(&format!("ping-{}", corr_id), timestamp)
}

/// Result of checking a ping after its timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    /// A pong arrived in time
    Answered,
    /// No pong yet; consecutive misses so far
    Missed(u32),
    /// Too many consecutive misses
    Dead(u32),
}

/// Ping/pong state for one channel
#[derive(Debug, Clone)]
pub struct KeepaliveState {
    outstanding: Option<(u64, Instant)>,
    missed: u32,
    max_missed: u32,
    next_corr: u64,
    last_rtt: Option<Duration>,
}

impl KeepaliveState {
    /// Create state that declares death after `max_missed` misses (at least one)
    pub fn new(max_missed: u32) -> Self {
        Self {
            outstanding: None,
            missed: 0,
            max_missed: max_missed.max(1),
            next_corr: 0,
            last_rtt: None,
        }
    }

    /// Record a ping going out, returning its correlation id
    pub fn record_ping(&mut self, now: Instant) -> u64 {
        self.next_corr += 1;
        self.outstanding = Some((self.next_corr, now));
        self.next_corr
    }

    /// Record a pong, returning the RTT if a ping was outstanding
    pub fn record_pong(&mut self, now: Instant) -> Option<Duration> {
        self.missed = 0;
        let (_, sent_at) = self.outstanding.take()?;
        let rtt = now.saturating_duration_since(sent_at);
        self.last_rtt = Some(rtt);
        Some(rtt)
    }

    /// Evaluate the ping `corr_id` once its timeout has elapsed
    pub fn check(&mut self, corr_id: u64) -> HeartbeatVerdict {
        match self.outstanding {
            Some((outstanding, _)) if outstanding == corr_id => {
                self.outstanding = None;
                self.missed += 1;
                if self.missed >= self.max_missed {
                    HeartbeatVerdict::Dead(self.missed)
                } else {
                    HeartbeatVerdict::Missed(self.missed)
                }
            }
            _ => HeartbeatVerdict::Answered,
        }
    }

    /// Consecutive misses
    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// Most recent round-trip time
    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    /// Forget any outstanding ping and misses, keeping the last RTT
    pub fn reset(&mut self) {
        self.outstanding = None;
        self.missed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pam_wire::PING_TYPE;

    #[test]
    fn test_ping_frame() {
        let frame: serde_json::Value = serde_json::from_str(&build_ping(7, Utc::now()).unwrap()).unwrap();
        assert_eq!(frame["type"], PING_TYPE);
        assert_eq!(frame["clientMessageId"], "ping-7");
    }

    #[test]
    fn test_answered_ping_measures_rtt() {
        let start = Instant::now();
        let mut state = KeepaliveState::new(2);
        let corr = state.record_ping(start);

        let rtt = state.record_pong(start + Duration::from_millis(40));
        assert_eq!(rtt, Some(Duration::from_millis(40)));
        assert_eq!(state.check(corr), HeartbeatVerdict::Answered);
        assert_eq!(state.last_rtt(), Some(Duration::from_millis(40)));
    }

    #[test]
    fn test_consecutive_misses_declare_death() {
        let start = Instant::now();
        let mut state = KeepaliveState::new(2);

        let first = state.record_ping(start);
        assert_eq!(state.check(first), HeartbeatVerdict::Missed(1));

        let second = state.record_ping(start + Duration::from_secs(20));
        assert_eq!(state.check(second), HeartbeatVerdict::Dead(2));
    }

    #[test]
    fn test_late_pong_resets_misses() {
        let start = Instant::now();
        let mut state = KeepaliveState::new(2);

        let first = state.record_ping(start);
        assert_eq!(state.check(first), HeartbeatVerdict::Missed(1));
        assert_eq!(state.record_pong(start + Duration::from_secs(12)), None);
        assert_eq!(state.missed(), 0);

        let second = state.record_ping(start + Duration::from_secs(20));
        assert_eq!(state.check(second), HeartbeatVerdict::Missed(1));
    }

    #[test]
    fn test_reset() {
        let mut state = KeepaliveState::new(1);
        let corr = state.record_ping(Instant::now());
        state.reset();
        assert_eq!(state.check(corr), HeartbeatVerdict::Answered);
    }
}
