//! PING keepalive bookkeeping.
//!
//! The session driver sends a `PING` request on a fixed interval while the
//! session is ready. Each PING is an ordinary correlated request; this module
//! tracks how many have failed in a row and the last measured round trip.

use std::time::Duration;

use loco_wire::{Packet, WireError};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Keepalive request method
pub const PING_METHOD: &str = "PING";

/// Build an empty-bodied PING request
pub fn build_ping(packet_id: i32) -> Result<Packet, WireError> {
    Packet::new(packet_id, PING_METHOD, Vec::new())
}

/// Interval whose first tick is one full period away
pub fn ping_interval(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Consecutive-failure tracking for keepalive PINGs
#[derive(Debug, Clone)]
pub struct KeepaliveTracker {
    threshold: u32,
    consecutive_failures: u32,
    last_rtt: Option<Duration>,
}

impl KeepaliveTracker {
    /// Create a tracker that trips after `threshold` consecutive failures.
    ///
    /// A threshold of 0 never trips.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            consecutive_failures: 0,
            last_rtt: None,
        }
    }

    /// Record a PING answered after `rtt`
    pub fn record_success(&mut self, rtt: Duration) {
        self.consecutive_failures = 0;
        self.last_rtt = Some(rtt);
    }

    /// Record a PING that timed out; returns true once the threshold is reached
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.threshold > 0 && self.consecutive_failures >= self.threshold
    }

    /// Failures since the last answered PING
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Round trip of the most recent answered PING
    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_packet() {
        let ping = build_ping(42).unwrap();
        assert_eq!(ping.method, "PING");
        assert_eq!(ping.packet_id, 42);
        assert!(ping.body.is_empty());
    }

    #[test]
    fn test_threshold() {
        let mut tracker = KeepaliveTracker::new(3);
        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());
        tracker.record_success(Duration::from_millis(12));
        assert_eq!(tracker.consecutive_failures(), 0);
        assert_eq!(tracker.last_rtt(), Some(Duration::from_millis(12)));

        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());
        assert!(tracker.record_failure());
    }

    #[test]
    fn test_zero_threshold_never_trips() {
        let mut tracker = KeepaliveTracker::new(0);
        for _ in 0..10 {
            assert!(!tracker.record_failure());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_skips_immediate_tick() {
        let start = Instant::now();
        let mut interval = ping_interval(Duration::from_secs(60));
        interval.tick().await;
        assert!(start.elapsed() >= Duration::from_secs(60));
    }
}
