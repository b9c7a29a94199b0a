//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::net::SimulatorSettings;
use crate::util::time::{SIMULATION_TPS, SNAPSHOT_TPS};

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable text
    pub log_json: bool,
    /// Allowed client origins for CORS (`*` allows any)
    pub client_origin: String,

    /// Room simulation and sync settings
    pub room: RoomConfig,

    /// Fault injection for development
    pub simulator: SimulatorSettings,
}

/// Longest lag compensation window a room will keep history for
pub const MAX_HISTORY_WINDOW_MS: u64 = 5_000;

/// Per-room tuning shared by every room the server spawns
#[derive(Clone, Debug)]
pub struct RoomConfig {
    /// Simulation ticks per second
    pub tick_rate: u32,
    /// Snapshot broadcasts per second
    pub broadcast_rate: u32,
    pub max_players: usize,
    /// Lag compensation window in milliseconds
    pub history_window_ms: u64,
    /// Send `state:delta` against acknowledged baselines
    pub delta_compression: bool,
    /// Broadcasts without an ack before a baseline is considered stale
    pub delta_stale_after: u32,
    /// Forced full snapshot cadence (0 disables)
    pub full_snapshot_interval_ms: u64,
    pub ping_interval_ms: u64,
    /// Consecutive unanswered pings before a player is dropped
    pub ping_miss_limit: u32,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            tick_rate: SIMULATION_TPS,
            broadcast_rate: SNAPSHOT_TPS,
            max_players: 8,
            history_window_ms: 1000,
            delta_compression: true,
            delta_stale_after: 10,
            full_snapshot_interval_ms: 1000,
            ping_interval_ms: 2000,
            ping_miss_limit: 3,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_level: "info".to_string(),
            log_json: false,
            client_origin: "*".to_string(),
            room: RoomConfig::default(),
            simulator: SimulatorSettings::disabled(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Hosting platforms provide PORT, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let defaults = RoomConfig::default();
        let room = RoomConfig {
            tick_rate: parse_or("TICK_RATE", defaults.tick_rate)?.max(1),
            broadcast_rate: parse_or("BROADCAST_RATE", defaults.broadcast_rate)?.max(1),
            max_players: parse_or("MAX_PLAYERS_PER_ROOM", defaults.max_players)?.max(1),
            history_window_ms: parse_or("HISTORY_WINDOW_MS", defaults.history_window_ms)?
                .min(MAX_HISTORY_WINDOW_MS),
            delta_compression: parse_or("DELTA_COMPRESSION", defaults.delta_compression)?,
            delta_stale_after: parse_or("DELTA_STALE_AFTER", defaults.delta_stale_after)?,
            full_snapshot_interval_ms: parse_or(
                "FULL_SNAPSHOT_INTERVAL_MS",
                defaults.full_snapshot_interval_ms,
            )?,
            ping_interval_ms: parse_or("PING_INTERVAL_MS", defaults.ping_interval_ms)?,
            ping_miss_limit: parse_or("PING_MISS_LIMIT", defaults.ping_miss_limit)?,
        };

        let simulator = SimulatorSettings::new(
            parse_or("SIMULATE_LATENCY", 0)?,
            parse_or("SIMULATE_PACKET_LOSS", 0.0)?,
            parse_or("SIMULATE_JITTER", SimulatorSettings::DEFAULT_JITTER_MS)?,
        );

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_json: env::var("LOG_FORMAT")
                .map(|f| f.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
            client_origin: env::var("CLIENT_ORIGIN").unwrap_or_else(|_| "*".to_string()),

            room,
            simulator,
        })
    }
}

/// Parse an optional variable, keeping the default when it is unset or empty
fn parse_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(name)),
        _ => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_or_uses_default_when_unset() {
        let value: u32 = parse_or("ARENA_SYNC_TEST_UNSET_VAR", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn parse_or_rejects_garbage() {
        env::set_var("ARENA_SYNC_TEST_GARBAGE_VAR", "sixty");
        let result: Result<u32, _> = parse_or("ARENA_SYNC_TEST_GARBAGE_VAR", 60);
        assert!(matches!(result, Err(ConfigError::Invalid("ARENA_SYNC_TEST_GARBAGE_VAR"))));
        env::remove_var("ARENA_SYNC_TEST_GARBAGE_VAR");
    }

    #[test]
    fn oversized_history_window_is_clamped() {
        env::set_var("HISTORY_WINDOW_MS", u64::MAX.to_string());
        let config = Config::from_env();
        env::remove_var("HISTORY_WINDOW_MS");
        assert_eq!(config.unwrap().room.history_window_ms, MAX_HISTORY_WINDOW_MS);
    }

    #[test]
    fn default_room_config_matches_documented_rates() {
        let room = RoomConfig::default();
        assert_eq!(room.tick_rate, 60);
        assert_eq!(room.broadcast_rate, 20);
        assert_eq!(room.max_players, 8);
        assert_eq!(room.history_window_ms, 1000);
    }
}
