//! Application configuration.
//!
//! Loaded the way the teacher's services load theirs: built-in defaults,
//! optionally overridden by a TOML file, finally overridden by environment
//! variables. `dotenv` is applied once in `main` before any of this runs.

use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

use crate::prelude::*;

/// Root application configuration.
#[derive(Clone, Debug, Serialize, Deserialize, SmartDefault)]
#[serde(default)]
pub struct Conf {
    /// WebSocket / HTTP gateway settings.
    pub server: Server,

    /// Message queue tuning.
    pub queue: Queue,

    /// Connection health tracker tuning.
    pub connection: Connection,
}

impl Conf {
    /// Builds a [`Conf`] by layering defaults, an optional config file given
    /// by the `BROKER_CONFIG` environment variable, and environment
    /// variables prefixed `BROKER`.
    ///
    /// # Errors
    ///
    /// Errors if any configuration source is malformed.
    pub fn parse() -> Result<Self, config::ConfigError> {
        let mut cfg = config::Config::new();

        if let Ok(path) = std::env::var("BROKER_CONFIG") {
            cfg.merge(config::File::with_name(&path).required(false))?;
        }

        cfg.merge(
            config::Environment::with_prefix("BROKER").separator("__"),
        )?;

        cfg.try_into()
    }
}

/// WebSocket / HTTP gateway settings.
#[derive(Clone, Debug, Serialize, Deserialize, SmartDefault)]
#[serde(default)]
pub struct Server {
    /// TCP port the gateway listens on.
    #[default = 8080]
    pub ws_port: u16,

    /// HTTP path the WebSocket upgrade is served at.
    #[default(String::from("/ws"))]
    pub ws_path: String,

    /// Bind address for both the WebSocket and admin HTTP surfaces.
    #[default(String::from("0.0.0.0"))]
    pub bind_ip: String,

    /// Maximum pairwise connection records admitted per room.
    #[default = 20]
    pub max_connections_per_room: u32,

    /// Period of the room-stats reaper/idle-marking loop.
    #[default(humantime::Duration::from(std::time::Duration::from_secs(30)))]
    #[serde(with = "humantime_serde")]
    pub room_stats_monitor_interval: humantime::Duration,
}

/// Message queue tuning.
#[derive(Clone, Debug, Serialize, Deserialize, SmartDefault)]
#[serde(default)]
pub struct Queue {
    /// Interval between drain ticks.
    #[default(humantime::Duration::from(std::time::Duration::from_millis(100)))]
    #[serde(with = "humantime_serde")]
    pub drain_interval: humantime::Duration,

    /// Maximum messages taken from the head of a room's queue per tick.
    #[default = 10]
    pub batch_size: usize,

    /// Queue length above which stale `ice-candidate` entries are dropped.
    #[default = 1000]
    pub backpressure_threshold: usize,

    /// Age above which an `ice-candidate` is eligible for backpressure
    /// dropping.
    #[default(humantime::Duration::from(std::time::Duration::from_secs(5)))]
    #[serde(with = "humantime_serde")]
    pub candidate_staleness: humantime::Duration,
}

/// Connection health tracker tuning.
#[derive(Clone, Debug, Serialize, Deserialize, SmartDefault)]
#[serde(default)]
pub struct Connection {
    /// Time without an update, while `connected`, before a reconnection is
    /// triggered.
    #[default(humantime::Duration::from(std::time::Duration::from_secs(30)))]
    #[serde(with = "humantime_serde")]
    pub stale_after: humantime::Duration,

    /// Reconnection attempts allowed before a pair is considered exhausted.
    #[default = 3]
    pub max_reconnect_attempts: u32,

    /// Period of the health-tracker monitor loop.
    #[default(humantime::Duration::from(std::time::Duration::from_secs(10)))]
    #[serde(with = "humantime_serde")]
    pub monitor_interval: humantime::Duration,

    /// Period of the stale/exhausted-entry reaper loop.
    #[default(humantime::Duration::from(std::time::Duration::from_secs(60)))]
    #[serde(with = "humantime_serde")]
    pub reap_interval: humantime::Duration,

    /// Inactivity after which a health entry is reaped outright.
    #[default(humantime::Duration::from(std::time::Duration::from_secs(300)))]
    #[serde(with = "humantime_serde")]
    pub reap_after_idle: humantime::Duration,
}

/// Loads [`Conf`], logging the outcome.
pub fn load(log: &slog::Logger) -> Conf {
    match Conf::parse() {
        Ok(conf) => conf,
        Err(e) => {
            error!(log, "Failed to parse configuration, using defaults"; "error" => ?e);
            Conf::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let conf = Conf::default();
        assert_eq!(conf.server.max_connections_per_room, 20);
        assert_eq!(conf.queue.drain_interval.as_millis(), 100);
        assert_eq!(conf.queue.batch_size, 10);
        assert_eq!(conf.connection.stale_after.as_secs(), 30);
        assert_eq!(conf.connection.max_reconnect_attempts, 3);
        assert_eq!(conf.server.room_stats_monitor_interval.as_secs(), 30);
    }
}
