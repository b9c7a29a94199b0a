//! Round-trip time tracking
//!
//! RTT samples are smoothed with an exponential moving average so a single
//! delayed packet does not swing lag compensation or correction tolerance.
//! The tracker also counts unanswered probes for connection timeouts.

/// Weight of the newest sample in the moving average
pub const RTT_SMOOTHING: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct PingTracker {
    alpha: f64,
    smoothed_rtt: Option<f64>,
    last_rtt: Option<u64>,
    samples: u64,
    last_sample_at: Option<u64>,
    outstanding: Option<u64>,
    missed: u32,
}

impl PingTracker {
    pub fn new() -> Self {
        Self::with_smoothing(RTT_SMOOTHING)
    }

    pub fn with_smoothing(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.01, 1.0),
            smoothed_rtt: None,
            last_rtt: None,
            samples: 0,
            last_sample_at: None,
            outstanding: None,
            missed: 0,
        }
    }

    /// Feed one RTT measurement taken at `now_ms`
    pub fn record_rtt(&mut self, rtt_ms: u64, now_ms: u64) {
        let sample = rtt_ms as f64;
        self.smoothed_rtt = Some(match self.smoothed_rtt {
            None => sample,
            Some(avg) => avg + self.alpha * (sample - avg),
        });
        self.last_rtt = Some(rtt_ms);
        self.samples += 1;
        self.last_sample_at = Some(now_ms);
    }

    /// Smoothed RTT in whole milliseconds (0 before the first sample)
    pub fn rtt_ms(&self) -> u64 {
        self.smoothed_rtt.map(|r| r.round() as u64).unwrap_or(0)
    }

    pub fn smoothed_rtt(&self) -> Option<f64> {
        self.smoothed_rtt
    }

    pub fn last_rtt(&self) -> Option<u64> {
        self.last_rtt
    }

    /// Estimated one-way latency: half the smoothed RTT
    pub fn one_way_latency_ms(&self) -> u64 {
        self.smoothed_rtt.map(|r| (r / 2.0).round() as u64).unwrap_or(0)
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn last_sample_at(&self) -> Option<u64> {
        self.last_sample_at
    }

    /// Register an outgoing probe; an unanswered previous probe counts as missed
    pub fn begin_probe(&mut self, now_ms: u64) {
        if self.outstanding.is_some() {
            self.missed += 1;
        }
        self.outstanding = Some(now_ms);
    }

    /// Handle an echo of a probe sent at `sent_at`; returns the RTT sample
    ///
    /// Only the outstanding probe is accepted. Stale, repeated or forged
    /// echoes neither reset the miss count nor feed the average.
    pub fn record_pong(&mut self, sent_at: u64, now_ms: u64) -> Option<u64> {
        if self.outstanding != Some(sent_at) || sent_at > now_ms {
            return None;
        }
        let rtt = now_ms - sent_at;
        self.record_rtt(rtt, now_ms);
        self.outstanding = None;
        self.missed = 0;
        Some(rtt)
    }

    pub fn missed_probes(&self) -> u32 {
        self.missed
    }

    pub fn is_timed_out(&self, miss_limit: u32) -> bool {
        miss_limit > 0 && self.missed >= miss_limit
    }
}

impl Default for PingTracker {
    fn default() -> Self {
        Self::new()
    }
}
