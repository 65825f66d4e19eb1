//! # Configuration Management
//!
//! Centralized configuration for the secure channel.
//!
//! This module provides structured configuration for servers and clients,
//! including handshake and polling timeouts, framing limits, key-derivation cost
//! and logging options.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! ## Security Considerations
//! - Both peers must use identical [`KdfParams`]; a mismatch derives different keys
//!   and fails the handshake confirmation step
//! - `max_string_len` bounds the allocation a peer can request with one length prefix

use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// Default upper bound for a length-prefixed string (1 MiB)
pub const MAX_STRING_LEN: usize = 1024 * 1024;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file; missing sections take their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ProtocolError::ConfigError(format!(
                "Failed to open config file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults overridden by `SECURE_CHANNEL_*` variables. The address applies
    /// to both the server and the client; so does the handshake timeout.
    ///
    /// # Errors
    /// [`ProtocolError::ConfigError`] when a variable is set but does not parse.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(address) = env_value::<String>("SECURE_CHANNEL_SERVER_ADDRESS")? {
            config.client.address.clone_from(&address);
            config.server.address = address;
        }
        if let Some(ms) = env_value::<u64>("SECURE_CHANNEL_HANDSHAKE_TIMEOUT_MS")? {
            config.server.handshake_timeout = Duration::from_millis(ms);
            config.client.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_value::<u64>("SECURE_CHANNEL_POLL_INTERVAL_MS")? {
            config.server.accept_poll_interval = Duration::from_millis(ms);
        }
        if let Some(limit) = env_value::<usize>("SECURE_CHANNEL_MAX_STRING_LEN")? {
            config.transport.max_string_len = limit;
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

    /// The defaults rendered as TOML, as a starting point for a config file.
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|e| format!("# could not render defaults: {e}\n"))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let rendered = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, rendered)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))
    }

    /// Every problem found across all sections; empty when the config is usable.
    pub fn validate(&self) -> Vec<String> {
        [
            self.server.validate(),
            self.client.validate(),
            self.transport.validate(),
            self.logging.validate(),
        ]
        .concat()
    }

    /// Like [`validate`](Self::validate), folding all problems into one error.
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            return Ok(());
        }
        Err(ProtocolError::ConfigError(format!(
            "Configuration validation failed:\n  - {}",
            errors.join("\n  - ")
        )))
    }
}

fn env_value<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ProtocolError::ConfigError(format!("Invalid value for {key}: '{raw}'"))),
        Err(_) => Ok(None),
    }
}

fn check_address(errors: &mut Vec<String>, side: &str, address: &str) {
    if address.is_empty() {
        errors.push(format!("{side} address cannot be empty"));
    } else if address.parse::<std::net::SocketAddr>().is_err() {
        errors.push(format!(
            "Invalid {} address format: '{address}' (expected host:port, e.g. '127.0.0.1:9000')",
            side.to_lowercase()
        ));
    }
}

fn check_min(errors: &mut Vec<String>, label: &str, value: Duration, min: Duration) {
    if value < min {
        errors.push(format!("{label} too short (minimum: {}ms)", min.as_millis()));
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Server listen address (e.g., "127.0.0.1:9000")
    pub address: String,

    /// How often the accept loop wakes up to observe a shutdown request
    #[serde(with = "duration_serde")]
    pub accept_poll_interval: Duration,

    /// Upper bound for a complete handshake on an accepted socket
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Time granted to a stale duplicate session to receive its log-out marker
    #[serde(with = "duration_serde")]
    pub eviction_timeout: Duration,

    /// Maximum number of concurrently handled sockets
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            accept_poll_interval: timeout::ACCEPT_POLL_INTERVAL,
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
            eviction_timeout: timeout::EVICTION_TIMEOUT,
            max_connections: 1000,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        check_address(&mut errors, "Server", &self.address);

        check_min(&mut errors, "Accept poll interval", self.accept_poll_interval, Duration::from_millis(10));
        // A long poll delays shutdown by up to one interval.
        if self.accept_poll_interval > Duration::from_secs(10) {
            errors.push("Accept poll interval too long (maximum: 10s)".to_string());
        }
        check_min(&mut errors, "Handshake timeout", self.handshake_timeout, Duration::from_millis(100));
        check_min(&mut errors, "Eviction timeout", self.eviction_timeout, Duration::from_millis(10));

        match self.max_connections {
            0 => errors.push("Max connections must be greater than 0".to_string()),
            n if n > 100_000 => errors.push(format!(
                "Max connections very high: {n} (each holds a task and a socket)"
            )),
            _ => {}
        }
        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Target server address
    pub address: String,

    /// Timeout for the TCP connection attempt
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Upper bound for a complete login or registration handshake
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        check_address(&mut errors, "Client", &self.address);
        check_min(&mut errors, "Connection timeout", self.connection_timeout, Duration::from_millis(100));
        check_min(&mut errors, "Handshake timeout", self.handshake_timeout, Duration::from_millis(100));
        errors
    }
}

/// Argon2id cost parameters used to stretch passwords into channel keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Degree of parallelism
    pub lanes: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: argon2::Params::DEFAULT_M_COST,
            iterations: argon2::Params::DEFAULT_T_COST,
            lanes: argon2::Params::DEFAULT_P_COST,
        }
    }
}

impl KdfParams {
    /// Minimal cost, for tests and benchmarks only
    pub fn insecure_fast() -> Self {
        Self {
            memory_kib: 64,
            iterations: 1,
            lanes: 1,
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Largest accepted length prefix for strings
    pub max_string_len: usize,

    /// Password stretching cost
    #[serde(default)]
    pub kdf: KdfParams,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_string_len: MAX_STRING_LEN,
            kdf: KdfParams::default(),
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_string_len == 0 {
            errors.push("Max string length cannot be 0".to_string());
        } else if self.max_string_len > i32::MAX as usize {
            errors.push(format!(
                "Max string length too large: {} (must fit a 4-byte length prefix)",
                self.max_string_len
            ));
        }

        if self.kdf.lanes == 0 {
            errors.push("KDF lanes must be greater than 0".to_string());
        }
        if self.kdf.iterations == 0 {
            errors.push("KDF iterations must be greater than 0".to_string());
        }
        if self.kdf.memory_kib < 8 * self.kdf.lanes {
            errors.push(format!(
                "KDF memory too small: {} KiB (minimum: 8 KiB per lane)",
                self.kdf.memory_kib
            ));
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
            app_name: String::from("secure-channel"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        match self.app_name.len() {
            0 => vec!["Application name cannot be empty".to_string()],
            n if n > 64 => vec![format!("Application name too long: {n} characters (maximum: 64)")],
            _ => Vec::new(),
        }
    }
}

/// Durations are written as whole milliseconds; longer ones saturate.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Levels are written in lower case and read case-insensitively.
mod log_level_serde {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use tracing::Level;

    pub fn serialize<S: Serializer>(level: &Level, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&level.as_str().to_ascii_lowercase())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Level, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse()
            .map_err(|_| D::Error::custom(format!("Invalid log level: {raw}")))
    }
}
