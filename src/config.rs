//! # Configuration Management
//!
//! Centralized configuration for the relay client engine.
//!
//! This module provides structured configuration for connection lifecycle,
//! transport framing and encryption, and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (prefix `RELAY_LINK_`)
//!
//! Relay addresses and the shared secret normally come from the secure store;
//! the optional address fields here are explicit overrides.

use crate::error::{ProtocolError, Result};
use crate::transport::address::Address;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Port assumed when an address string carries no valid `:port` suffix
pub const DEFAULT_PORT: u16 = 1359;

/// Max allowed payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Whether to encrypt frames by default (requires a shared secret)
pub const ENABLE_ENCRYPTION: bool = true;

/// Default size of one upload chunk
pub const DEFAULT_UPLOAD_CHUNK_SIZE: usize = 256 * 1024;

/// Default number of relay-pushed transfers reassembled at once
pub const DEFAULT_MAX_INBOUND_TRANSFERS: usize = 4;

/// Default cap on bytes buffered across all partial inbound transfers (64 MB)
pub const DEFAULT_MAX_INBOUND_BUFFER: usize = 64 * 1024 * 1024;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ClientConfig {
    /// Connection lifecycle configuration
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("RELAY_LINK_RELAY_ADDRESS") {
            config.connection.relay_address = Some(addr);
        }

        if let Ok(addr) = std::env::var("RELAY_LINK_FALLBACK_ADDRESS") {
            config.connection.fallback_address = Some(addr);
        }

        if let Ok(name) = std::env::var("RELAY_LINK_CLIENT_NAME") {
            config.connection.client_name = name;
        }

        if let Ok(timeout) = std::env::var("RELAY_LINK_CONNECT_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.connection.connect_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(timeout) = std::env::var("RELAY_LINK_RESPONSE_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.connection.response_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(heartbeat) = std::env::var("RELAY_LINK_HEARTBEAT_INTERVAL_MS") {
            if let Ok(val) = heartbeat.parse::<u64>() {
                config.connection.heartbeat_interval = Duration::from_millis(val);
            }
        }

        if let Ok(flag) = std::env::var("RELAY_LINK_AUTO_RECONNECT") {
            if let Ok(val) = flag.parse::<bool>() {
                config.connection.auto_reconnect = val;
            }
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
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.connection.validate());
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
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Connection lifecycle configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Name this client presents to the relay during authentication
    pub client_name: String,

    /// Primary relay address override (e.g. "relay.example.com:1359")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_address: Option<String>,

    /// Fallback relay address override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_address: Option<String>,

    /// Timeout for a single socket connect attempt
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Timeout for version negotiation plus authentication
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Timeout for waiting on a correlated response
    #[serde(with = "duration_serde")]
    pub response_timeout: Duration,

    /// Interval for sending keepalive pings
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// Silence from the relay longer than this tears the connection down
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,

    /// Whether to automatically reconnect on connection loss
    pub auto_reconnect: bool,

    /// Maximum number of consecutive reconnect attempts (0 = unlimited)
    pub max_reconnect_attempts: u32,

    /// Base delay between reconnect attempts
    #[serde(with = "duration_serde")]
    pub reconnect_delay: Duration,

    /// Upper bound for the exponential reconnect backoff
    #[serde(with = "duration_serde")]
    pub max_reconnect_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            client_name: String::from("relay-link"),
            relay_address: None,
            fallback_address: None,
            connect_timeout: timeout::DEFAULT_TIMEOUT,
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
            response_timeout: Duration::from_secs(30),
            heartbeat_interval: timeout::KEEPALIVE_INTERVAL,
            idle_timeout: timeout::IDLE_TIMEOUT,
            auto_reconnect: true,
            max_reconnect_attempts: 0,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
        }
    }
}

impl ConnectionConfig {
    /// Validate connection configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.client_name.is_empty() {
            errors.push("Client name cannot be empty".to_string());
        }

        for (label, address) in [
            ("relay", &self.relay_address),
            ("fallback", &self.fallback_address),
        ] {
            if let Some(address) = address {
                if let Err(e) = Address::parse(address) {
                    errors.push(format!("Invalid {label} address '{address}': {e}"));
                }
            }
        }

        if self.fallback_address.is_some() && self.relay_address.is_none() {
            errors.push("Fallback address override requires a relay address override".to_string());
        }

        if self.connect_timeout.as_millis() < 100 {
            errors.push("Connect timeout too short (minimum: 100ms)".to_string());
        } else if self.connect_timeout.as_secs() > 300 {
            errors.push("Connect timeout too long (maximum: 300s)".to_string());
        }

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        }

        if self.response_timeout.as_millis() < 100 {
            errors.push("Response timeout too short (minimum: 100ms)".to_string());
        }

        if self.heartbeat_interval.as_millis() < 100 {
            errors.push("Heartbeat interval too short (minimum: 100ms)".to_string());
        } else if self.heartbeat_interval.as_secs() > 3600 {
            errors.push("Heartbeat interval too long (maximum: 1 hour)".to_string());
        }

        if self.idle_timeout <= self.heartbeat_interval {
            errors.push("Idle timeout must be longer than the heartbeat interval".to_string());
        }

        if self.reconnect_delay.as_millis() < 10 {
            errors.push("Reconnect delay too short (minimum: 10ms)".to_string());
        } else if self.reconnect_delay.as_secs() > 60 {
            errors.push("Reconnect delay too long (maximum: 60s)".to_string());
        }

        if self.max_reconnect_delay < self.reconnect_delay {
            errors.push("Max reconnect delay cannot be shorter than reconnect delay".to_string());
        }

        errors
    }

    /// Backoff before reconnect attempt number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.reconnect_delay
            .saturating_mul(factor)
            .min(self.max_reconnect_delay)
    }
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Whether to encrypt frames once a shared secret is available
    pub encryption_enabled: bool,

    /// Maximum allowed payload size in bytes
    pub max_payload_size: usize,

    /// Maximum number of crypto operations overlapping in one direction
    pub pipeline_depth: usize,

    /// Capacity of the outbound frame queue
    pub outbound_queue: usize,

    /// Time allowed for a graceful shutdown before the socket is destroyed
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Size of one upload chunk
    pub upload_chunk_size: usize,

    /// Maximum number of relay-pushed transfers in progress at once
    #[serde(default = "default_max_inbound_transfers")]
    pub max_inbound_transfers: usize,

    /// Maximum bytes buffered across all partial inbound transfers
    #[serde(default = "default_max_inbound_buffer")]
    pub max_inbound_buffer: usize,
}

fn default_max_inbound_transfers() -> usize {
    DEFAULT_MAX_INBOUND_TRANSFERS
}

fn default_max_inbound_buffer() -> usize {
    DEFAULT_MAX_INBOUND_BUFFER
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            encryption_enabled: ENABLE_ENCRYPTION,
            max_payload_size: MAX_PAYLOAD_SIZE,
            pipeline_depth: 8,
            outbound_queue: 64,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
            upload_chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
            max_inbound_transfers: DEFAULT_MAX_INBOUND_TRANSFERS,
            max_inbound_buffer: DEFAULT_MAX_INBOUND_BUFFER,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_payload_size < 1024 {
            errors.push("Max payload size too small (minimum: 1 KB)".to_string());
        } else if self.max_payload_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max payload size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_payload_size
            ));
        }

        if self.pipeline_depth == 0 {
            errors.push("Pipeline depth must be greater than 0".to_string());
        }

        if self.outbound_queue == 0 {
            errors.push("Outbound queue capacity must be greater than 0".to_string());
        }

        if self.upload_chunk_size == 0 {
            errors.push("Upload chunk size must be greater than 0".to_string());
        } else if self.upload_chunk_size + 64 > self.max_payload_size {
            errors.push("Upload chunk size must leave room for the chunk header".to_string());
        }

        if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        if self.max_inbound_transfers == 0 {
            errors.push("Inbound transfer limit must be greater than 0".to_string());
        }

        if self.max_inbound_buffer == 0 {
            errors.push("Inbound buffer limit must be greater than 0".to_string());
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

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("relay-link"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
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

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
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
