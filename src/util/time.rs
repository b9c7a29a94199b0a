//! Time utilities for the simulation loop

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

/// Get current Unix timestamp in milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Server start time for uptime tracking
static SERVER_START: std::sync::OnceLock<(Instant, DateTime<Utc>)> = std::sync::OnceLock::new();

/// Initialize server start time (call once at startup)
pub fn init_server_time() {
    SERVER_START.get_or_init(|| (Instant::now(), Utc::now()));
}

/// Get server uptime in seconds
pub fn uptime_secs() -> u64 {
    SERVER_START
        .get()
        .map(|(start, _)| start.elapsed().as_secs())
        .unwrap_or(0)
}

/// Wall-clock start time as RFC 3339, if initialized
pub fn started_at() -> Option<String> {
    SERVER_START.get().map(|(_, at)| at.to_rfc3339())
}

/// Default tick rate configuration
pub const SIMULATION_TPS: u32 = 60;
pub const SNAPSHOT_TPS: u32 = 20;

/// Fixed simulation step (in seconds) for a tick rate
pub fn tick_delta(tick_rate: u32) -> f32 {
    1.0 / tick_rate.max(1) as f32
}

/// Fixed simulation step as a `Duration`
pub fn tick_duration(tick_rate: u32) -> Duration {
    Duration::from_micros(1_000_000 / tick_rate.max(1) as u64)
}

/// Number of simulation ticks between broadcasts (at least one)
pub fn ticks_per_broadcast(tick_rate: u32, broadcast_rate: u32) -> u32 {
    (tick_rate / broadcast_rate.max(1)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rates_give_three_ticks_per_broadcast() {
        assert_eq!(ticks_per_broadcast(SIMULATION_TPS, SNAPSHOT_TPS), 3);
        assert_eq!(ticks_per_broadcast(60, 120), 1);
        assert_eq!(ticks_per_broadcast(60, 0), 60);
    }

    #[test]
    fn tick_duration_matches_rate() {
        assert_eq!(tick_duration(60), Duration::from_micros(16_666));
        assert!((tick_delta(60) - 1.0 / 60.0).abs() < f32::EPSILON);
    }
}
