//! Clock abstraction for deterministic simulation
//!
//! Everything that reads time (tick timestamps, cooldowns, reloads, ping
//! timeouts, interpolation) goes through a [`Clock`] so tests can step time
//! by hand instead of sleeping.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of the current time, measured since the Unix epoch
pub trait Clock: Send + Sync {
    /// Current time since the Unix epoch
    fn now(&self) -> Duration;

    /// Current time in milliseconds since the Unix epoch
    fn now_ms(&self) -> u64 {
        self.now().as_millis() as u64
    }

    /// Milliseconds elapsed since `earlier_ms` (saturating at zero)
    fn since(&self, earlier_ms: u64) -> u64 {
        self.now_ms().saturating_sub(earlier_ms)
    }
}

/// Shared clock handle passed into rooms and client sessions
pub type SharedClock = Arc<dyn Clock>;

/// Wall clock used in production
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
    }
}

/// Manually stepped clock for tests
///
/// Clones share the same underlying time, so a test can keep one handle and
/// hand another to the code under test.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new(start: Duration) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Start at a fixed millisecond timestamp
    pub fn starting_at_ms(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }

    pub fn set(&self, to: Duration) {
        *self.now.lock() = to;
    }

    /// Wrap this clock into a shared handle
    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }
}
