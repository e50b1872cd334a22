//! Configuration for the server and client binaries.
//!
//! Both configurations load from TOML, every key has a default, and the
//! binaries apply command line overrides on top before calling
//! [`ServerConfig::validate`] or [`ClientConfig::validate`].

use crate::buffer::FIELD_COUNT;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Configuration for the sending side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Bytes per message. Must be a non-zero multiple of the field count.
    #[serde(default = "default_message_size")]
    pub message_size: usize,
    /// Connections accepted over the whole session.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Request zero-copy transmission. Falls back to copying when the
    /// platform refuses it.
    #[serde(default)]
    pub zero_copy: bool,
    /// Messages a worker sends between flushes into the shared statistics.
    #[serde(default = "default_flush_every")]
    pub flush_every: u64,
    /// Sleep after a zero-copy send is refused for lack of resources.
    #[serde(default = "default_backoff", with = "humantime_serde")]
    pub backoff: Duration,
    /// How long shutdown waits for workers before forcing their sockets
    /// closed.
    #[serde(default = "default_drain_grace", with = "humantime_serde")]
    pub drain_grace: Duration,
    /// Messages sent per connection. Unlimited when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<u64>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            message_size: default_message_size(),
            max_connections: default_max_connections(),
            zero_copy: false,
            flush_every: default_flush_every(),
            backoff: default_backoff(),
            drain_grace: default_drain_grace(),
            messages: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parse a configuration file. Call [`Self::validate`] once overrides
    /// are applied.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        load_toml(path.as_ref())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_message_size(self.message_size)?;
        require_nonzero("max_connections", self.max_connections as u64)?;
        require_nonzero("flush_every", self.flush_every)?;
        if self.messages == Some(0) {
            return Err(ConfigError::Invalid(
                "messages must be greater than zero when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn field_size(&self) -> usize {
        self.message_size / FIELD_COUNT
    }
}

/// Configuration for the receiving side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    #[serde(default = "default_server")]
    pub server: SocketAddr,
    #[serde(default = "default_message_size")]
    pub message_size: usize,
    /// Run length, for example "10s" or "2m".
    #[serde(default = "default_duration", with = "humantime_serde")]
    pub duration: Duration,
    /// Concurrent receive connections.
    #[serde(default = "default_connections")]
    pub connections: usize,
    /// Take one latency sample every this many messages.
    #[serde(default = "default_latency_every")]
    pub latency_every: u64,
    /// Report progress every this many messages per connection.
    #[serde(default = "default_progress_every")]
    pub progress_every: u64,
    /// Compare every received field against the filler pattern.
    #[serde(default)]
    pub verify: bool,
    /// Socket read timeout used to observe shutdown and the deadline on an
    /// idle stream.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            message_size: default_message_size(),
            duration: default_duration(),
            connections: default_connections(),
            latency_every: default_latency_every(),
            progress_every: default_progress_every(),
            verify: false,
            poll_interval: default_poll_interval(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Parse a configuration file. Call [`Self::validate`] once overrides
    /// are applied.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        load_toml(path.as_ref())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_message_size(self.message_size)?;
        require_nonzero("connections", self.connections as u64)?;
        require_nonzero("latency_every", self.latency_every)?;
        require_nonzero("progress_every", self.progress_every)?;
        if self.poll_interval.is_zero() {
            // A zero read timeout is rejected by the socket layer.
            return Err(ConfigError::Invalid(
                "poll_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn field_size(&self) -> usize {
        self.message_size / FIELD_COUNT
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_true")]
    pub timestamps: bool,
    #[serde(default)]
    pub thread_names: bool,
    #[serde(default = "default_true")]
    pub target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
            thread_names: false,
            target: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(String),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("message_size must be a non-zero multiple of 8, got {0}")]
    MessageSize(usize),
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn load_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
    toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
}

fn validate_message_size(message_size: usize) -> Result<(), ConfigError> {
    if message_size == 0 || message_size % FIELD_COUNT != 0 {
        return Err(ConfigError::MessageSize(message_size));
    }
    Ok(())
}

fn require_nonzero(name: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!(
            "{name} must be greater than zero"
        )));
    }
    Ok(())
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_server() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_message_size() -> usize {
    4096
}

fn default_max_connections() -> usize {
    100
}

fn default_flush_every() -> u64 {
    1000
}

fn default_backoff() -> Duration {
    Duration::from_micros(1)
}

fn default_drain_grace() -> Duration {
    Duration::from_secs(2)
}

fn default_duration() -> Duration {
    Duration::from_secs(10)
}

fn default_connections() -> usize {
    1
}

fn default_latency_every() -> u64 {
    100
}

fn default_progress_every() -> u64 {
    10_000
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Durations written as "60s", "500ms", "2m".
pub mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Render in the largest unit that represents `duration` exactly.
    pub fn format(duration: Duration) -> String {
        let nanos = duration.as_nanos();
        if nanos == 0 {
            "0s".to_string()
        } else if nanos % 1_000_000_000 == 0 {
            format!("{}s", duration.as_secs())
        } else if nanos % 1_000_000 == 0 {
            format!("{}ms", duration.as_millis())
        } else if nanos % 1_000 == 0 {
            format!("{}us", duration.as_micros())
        } else {
            format!("{nanos}ns")
        }
    }

    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty duration".to_string());
        }

        let (num, suffix) = s.split_at(s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len()));

        let value: u64 = num.parse().map_err(|e| format!("invalid number: {e}"))?;

        let multiplier = match suffix.trim() {
            "s" | "sec" | "secs" => 1,
            "m" | "min" | "mins" => 60,
            "h" | "hr" | "hrs" | "hour" | "hours" => 3600,
            "ms" => return Ok(Duration::from_millis(value)),
            "us" => return Ok(Duration::from_micros(value)),
            "ns" => return Ok(Duration::from_nanos(value)),
            // bare numbers are seconds
            "" => 1,
            other => return Err(format!("unknown time unit: {other}")),
        };

        value
            .checked_mul(multiplier)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration overflow: {s}"))
    }
}
