//! # Configuration Management
//!
//! Tunables for the socket engine.
//!
//! Ports and member limits are always passed to the start calls; this module
//! only covers the knobs around them: bind addresses, poll intervals, payload
//! ceilings and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()`

use crate::core::codec::DEFAULT_MAX_PAYLOAD;
use crate::error::{NetworkError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Bind address used when none is configured (all interfaces)
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

/// Largest payload a single UDP datagram can carry over IPv4
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Top-level engine configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct EngineConfig {
    /// TCP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// TCP client configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// UDP peer mesh configuration
    #[serde(default)]
    pub peer: PeerConfig,

    /// Framing and socket options shared by every mode
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| NetworkError::Config(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| NetworkError::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| NetworkError::Config(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults overridden by `NEX_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("NEX_BIND_ADDRESS") {
            config.server.bind_address = addr.clone();
            config.peer.bind_address = addr;
        }

        if let Ok(size) = std::env::var("NEX_MAX_PAYLOAD_SIZE") {
            config.transport.max_payload_size = size
                .parse::<usize>()
                .map_err(|e| NetworkError::Config(format!("NEX_MAX_PAYLOAD_SIZE: {e}")))?;
        }

        if let Ok(ms) = std::env::var("NEX_ACCEPT_POLL_MS") {
            let ms = ms
                .parse::<u64>()
                .map_err(|e| NetworkError::Config(format!("NEX_ACCEPT_POLL_MS: {e}")))?;
            config.server.accept_poll_interval = Duration::from_millis(ms);
        }

        if let Ok(ms) = std::env::var("NEX_PEER_POLL_MS") {
            let ms = ms
                .parse::<u64>()
                .map_err(|e| NetworkError::Config(format!("NEX_PEER_POLL_MS: {e}")))?;
            config.peer.poll_interval = Duration::from_millis(ms);
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| NetworkError::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| NetworkError::Config(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.peer.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(NetworkError::Config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn validate_ip(field: &str, value: &str, errors: &mut Vec<String>) {
    if value.is_empty() {
        errors.push(format!("{field} cannot be empty"));
    } else if value.parse::<IpAddr>().is_err() {
        errors.push(format!(
            "Invalid {field}: '{value}' (expected an IP address such as '0.0.0.0')"
        ));
    }
}

/// TCP server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Interface the listener binds to; the port is passed to `start_server`
    pub bind_address: String,

    /// Listen backlog handed to the OS
    pub backlog: i32,

    /// How often the accept loop re-checks the running flag while idle
    #[serde(with = "duration_serde")]
    pub accept_poll_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: String::from(DEFAULT_BIND_ADDRESS),
            backlog: 128,
            accept_poll_interval: Duration::from_millis(10),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        validate_ip("server bind address", &self.bind_address, &mut errors);

        if self.backlog <= 0 {
            errors.push("Listen backlog must be greater than 0".to_string());
        }

        if self.accept_poll_interval.is_zero() {
            errors.push("Accept poll interval must be greater than 0".to_string());
        } else if self.accept_poll_interval.as_secs() > 5 {
            errors.push("Accept poll interval too long (maximum: 5s)".to_string());
        }

        errors
    }
}

/// TCP client configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Connect timeout; `None` blocks until the OS gives up
    #[serde(with = "option_duration_serde", default = "default_connect_timeout")]
    pub connect_timeout: Option<Duration>,
}

fn default_connect_timeout() -> Option<Duration> {
    Some(Duration::from_secs(5))
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if let Some(timeout) = self.connect_timeout {
            if timeout.as_millis() < 10 {
                errors.push("Connect timeout too short (minimum: 10ms)".to_string());
            }
        }
        errors
    }
}

/// UDP peer mesh configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PeerConfig {
    /// Interface the peer socket binds to; the port is passed to `start_peer`
    pub bind_address: String,

    /// Receive buffer size, and the largest datagram that will be sent
    pub max_datagram_size: usize,

    /// Datagrams queued per peer before new ones are dropped
    pub inbox_capacity: usize,

    /// Receive timeout used to re-check the running flag
    #[serde(with = "duration_serde")]
    pub poll_interval: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            bind_address: String::from(DEFAULT_BIND_ADDRESS),
            max_datagram_size: MAX_UDP_PAYLOAD,
            inbox_capacity: 1024,
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl PeerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        validate_ip("peer bind address", &self.bind_address, &mut errors);

        if self.max_datagram_size < 16 {
            errors.push("Max datagram size too small (minimum: 16 bytes)".to_string());
        } else if self.max_datagram_size > MAX_UDP_PAYLOAD {
            errors.push(format!(
                "Max datagram size too large: {} (maximum: {MAX_UDP_PAYLOAD})",
                self.max_datagram_size
            ));
        }

        if self.inbox_capacity == 0 {
            errors.push("Peer inbox capacity must be greater than 0".to_string());
        }

        if self.poll_interval.is_zero() {
            errors.push("Peer poll interval must be greater than 0".to_string());
        } else if self.poll_interval.as_secs() > 5 {
            errors.push("Peer poll interval too long (maximum: 5s)".to_string());
        }

        errors
    }
}

/// Framing and socket options
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Maximum allowed payload size in bytes
    pub max_payload_size: usize,

    /// Disable Nagle's algorithm on TCP streams
    pub nodelay: bool,

    /// Bound on one blocking TCP write; `None` waits for the peer forever
    #[serde(with = "option_duration_serde", default = "default_write_timeout")]
    pub write_timeout: Option<Duration>,
}

fn default_write_timeout() -> Option<Duration> {
    Some(Duration::from_secs(10))
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            nodelay: true,
            write_timeout: default_write_timeout(),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_payload_size == 0 {
            errors.push("Max payload size cannot be 0".to_string());
        } else if self.max_payload_size > u32::MAX as usize {
            errors.push(format!(
                "Max payload size too large: {} bytes (length field is 32 bits)",
                self.max_payload_size
            ));
        }

        if let Some(timeout) = self.write_timeout {
            if timeout.as_millis() < 10 {
                errors.push("Write timeout too short (minimum: 10ms)".to_string());
            }
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("nex-network"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Optional durations; zero milliseconds means "no timeout"
mod option_duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.map(|d| d.as_millis() as u64).unwrap_or(0);
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok((millis > 0).then(|| Duration::from_millis(millis)))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
