//! Server configuration
//!
//! Defaults mirror the conventional Action Cable deployment: `/cable`
//! endpoint, cookie header forwarded to the application, moderate fan-out
//! pool. The CLI layer (`main.rs`) overrides fields from flags and
//! environment variables.

use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Precision of the timestamp embedded in ping frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampPrecision {
    #[default]
    Seconds,
    Milliseconds,
    Nanoseconds,
}

impl TimestampPrecision {
    /// Current unix timestamp at this precision.
    pub fn now(&self) -> i64 {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);

        match self {
            TimestampPrecision::Seconds => elapsed.as_secs() as i64,
            TimestampPrecision::Milliseconds => elapsed.as_millis() as i64,
            TimestampPrecision::Nanoseconds => elapsed.as_nanos() as i64,
        }
    }
}

impl FromStr for TimestampPrecision {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "s" => Ok(TimestampPrecision::Seconds),
            "ms" => Ok(TimestampPrecision::Milliseconds),
            "ns" => Ok(TimestampPrecision::Nanoseconds),
            other => Err(ConfigError::InvalidPrecision(other.to_string())),
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind host.
    pub host: String,
    /// Server bind port.
    pub port: u16,
    /// WebSocket endpoint paths.
    pub paths: Vec<String>,
    /// HTTP health endpoint path.
    pub health_path: String,
    /// Header allowlist forwarded to the application (lowercased).
    pub headers: Vec<String>,
    /// Cookie keys forwarded to the application. Empty means all.
    pub cookies: Vec<String>,

    /// Broadcast fan-out worker count.
    pub hub_gopool_size: usize,
    /// Gauge collection period in seconds.
    pub stats_refresh_interval: u64,

    /// Ping period in seconds.
    pub ping_interval: u64,
    pub ping_timestamp_precision: TimestampPrecision,

    /// Max Disconnect calls per second.
    pub disconnect_rate: u32,
    /// Disconnect queue shutdown budget in seconds.
    pub disconnect_timeout: u64,
    /// Skip the Disconnect callback entirely.
    pub disable_disconnect: bool,

    /// Socket read buffer hint in bytes.
    pub read_buffer_size: usize,
    /// Socket write buffer size in bytes.
    pub write_buffer_size: usize,
    /// Max inbound frame size in bytes.
    pub max_message_size: usize,
    /// Per-write deadline in seconds.
    pub write_timeout: u64,

    /// How often to log a metrics snapshot, in seconds. 0 disables it.
    pub metrics_rotate_interval: u64,

    pub log_level: String,
    pub log_format: String,
    pub debug: bool,

    /// Secret for `$pubsub` signed streams.
    pub streams_secret: Option<String>,
    /// Allow unsigned `$pubsub` stream names.
    pub public_streams: bool,
    /// Secret for Turbo Streams subscriptions.
    pub turbo_rails_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
            paths: vec!["/cable".to_string()],
            health_path: "/health".to_string(),
            headers: vec!["cookie".to_string()],
            cookies: Vec::new(),
            hub_gopool_size: 16,
            stats_refresh_interval: 5,
            ping_interval: 3,
            ping_timestamp_precision: TimestampPrecision::Seconds,
            disconnect_rate: 100,
            disconnect_timeout: 5,
            disable_disconnect: false,
            read_buffer_size: 1024,
            write_buffer_size: 1024,
            max_message_size: 65536,
            write_timeout: 2,
            metrics_rotate_interval: 0,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            debug: false,
            streams_secret: None,
            public_streams: false,
            turbo_rails_key: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hub_gopool_size == 0 {
            return Err(ConfigError::InvalidValue(
                "hub_gopool_size",
                "must be positive",
            ));
        }
        if self.disconnect_rate == 0 {
            return Err(ConfigError::InvalidValue(
                "disconnect_rate",
                "must be positive",
            ));
        }
        if self.paths.is_empty() {
            return Err(ConfigError::InvalidValue(
                "path",
                "at least one endpoint path is required",
            ));
        }
        Ok(())
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval)
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid ping timestamp precision: {0} (expected s, ms or ns)")]
    InvalidPrecision(String),
    #[error("invalid {0}: {1}")]
    InvalidValue(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.paths, vec!["/cable"]);
        assert_eq!(config.headers, vec!["cookie"]);
    }

    #[test]
    fn test_precision_parsing() {
        assert_eq!(
            "ms".parse::<TimestampPrecision>().unwrap(),
            TimestampPrecision::Milliseconds
        );
        assert!("minutes".parse::<TimestampPrecision>().is_err());
    }

    #[test]
    fn test_precision_scale() {
        let seconds = TimestampPrecision::Seconds.now();
        let millis = TimestampPrecision::Milliseconds.now();
        assert!(millis / 1000 - seconds <= 1);
    }

    #[test]
    fn test_validate_rejects_zero_pool() {
        let config = Config {
            hub_gopool_size: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
