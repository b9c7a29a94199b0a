//! Server clock estimation
//!
//! The client probes the server with pings. Each pong yields an RTT sample
//! and an offset sample `serverTime - (sentAt + rtt/2)`; both are smoothed so
//! one delayed packet does not skew render time or attack timestamps.

use crate::net::PingTracker;

/// Weight of the newest offset sample
pub const OFFSET_SMOOTHING: f64 = 0.2;
/// Client probe cadence
pub const CLIENT_PING_INTERVAL_MS: u64 = 2_000;

#[derive(Debug, Clone)]
pub struct ServerClock {
    ping: PingTracker,
    offset_ms: Option<f64>,
    /// Offset came from a raw server timestamp, not a pong
    provisional: bool,
    last_probe_at: Option<u64>,
    probe_interval_ms: u64,
}

impl ServerClock {
    pub fn new() -> Self {
        Self {
            ping: PingTracker::new(),
            offset_ms: None,
            provisional: false,
            last_probe_at: None,
            probe_interval_ms: CLIENT_PING_INTERVAL_MS,
        }
    }

    /// Seed the offset from any server timestamp until a pong arrives
    pub fn observe_server_time(&mut self, server_time: u64, local_now: u64) {
        if self.offset_ms.is_none() {
            self.offset_ms = Some(server_time as f64 - local_now as f64);
            self.provisional = true;
        }
    }

    /// Handle a pong for a probe sent at local time `sent_at`
    pub fn on_pong(&mut self, sent_at: u64, server_time: u64, local_now: u64) -> Option<u64> {
        let rtt = self.ping.record_pong(sent_at, local_now)?;
        let sample = server_time as f64 - (sent_at as f64 + rtt as f64 / 2.0);
        self.offset_ms = Some(match self.offset_ms {
            Some(offset) if !self.provisional => offset + OFFSET_SMOOTHING * (sample - offset),
            _ => sample,
        });
        self.provisional = false;
        Some(rtt)
    }

    /// Whether a probe is due; records the probe when it is
    pub fn poll_probe(&mut self, local_now: u64) -> bool {
        let due = self
            .last_probe_at
            .map_or(true, |at| local_now.saturating_sub(at) >= self.probe_interval_ms);
        if due {
            self.last_probe_at = Some(local_now);
            self.ping.begin_probe(local_now);
        }
        due
    }

    /// Estimated server time at local time `local_now`
    pub fn server_now(&self, local_now: u64) -> u64 {
        let offset = self.offset_ms.unwrap_or(0.0);
        (local_now as f64 + offset).max(0.0).round() as u64
    }

    pub fn offset_ms(&self) -> Option<f64> {
        self.offset_ms
    }

    pub fn rtt_ms(&self) -> u64 {
        self.ping.rtt_ms()
    }

    pub fn ping(&self) -> &PingTracker {
        &self.ping
    }
}

impl Default for ServerClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn pong_sets_offset_from_half_rtt() {
        let mut clock = ServerClock::new();
        // Server is 5s ahead, 100ms each way
        let rtt = clock.on_pong(1_000, 6_100, 1_200).unwrap();
        assert_eq!(rtt, 200);
        assert_approx_eq!(clock.offset_ms().unwrap(), 5_000.0);
        assert_eq!(clock.server_now(2_000), 7_000);
    }

    #[test]
    fn provisional_offset_is_replaced_by_first_pong() {
        let mut clock = ServerClock::new();
        clock.observe_server_time(6_000, 1_100);
        assert_approx_eq!(clock.offset_ms().unwrap(), 4_900.0);
        clock.observe_server_time(9_999, 1_100);
        assert_approx_eq!(clock.offset_ms().unwrap(), 4_900.0);

        clock.on_pong(1_000, 6_100, 1_200);
        assert_approx_eq!(clock.offset_ms().unwrap(), 5_000.0);
    }

    #[test]
    fn later_samples_are_smoothed() {
        let mut clock = ServerClock::new();
        clock.on_pong(1_000, 6_100, 1_200);
        clock.on_pong(3_000, 8_200, 3_200);
        // Sample 5100 moves the estimate a fifth of the way
        assert_approx_eq!(clock.offset_ms().unwrap(), 5_020.0);
    }

    #[test]
    fn probes_follow_interval() {
        let mut clock = ServerClock::new();
        assert!(clock.poll_probe(0));
        assert!(!clock.poll_probe(1_999));
        assert!(clock.poll_probe(2_000));
        assert_eq!(clock.ping().missed_probes(), 1);
    }

    #[test]
    fn future_pong_is_ignored() {
        let mut clock = ServerClock::new();
        assert!(clock.on_pong(5_000, 5_000, 4_000).is_none());
        assert!(clock.offset_ms().is_none());
    }
}
