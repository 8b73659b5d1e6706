//! # Configuration Management
//!
//! Structured configuration for hubs, servers and clients.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! Durations are written as integer milliseconds.

use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Default client pool capacity.
pub const DEFAULT_CLIENT_CAPACITY: u32 = 1;

/// Default number of reconnect attempts a request makes before failing.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Default pause between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(5);

/// How a connection carries frames once established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// HTTP upgrade to WebSocket, one binary message per frame
    #[default]
    WebSocket,
    /// Raw TCP byte stream framed by the frame codec
    Tcp,
}

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Hub (session registry) configuration
    #[serde(default)]
    pub hub: HubConfig,

    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
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

        if let Ok(addr) = std::env::var("FRAME_SESSION_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(timeout) = std::env::var("FRAME_SESSION_READ_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.hub.read_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(timeout) = std::env::var("FRAME_SESSION_RESPONSE_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.client.response_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(capacity) = std::env::var("FRAME_SESSION_CLIENT_CAPACITY") {
            if let Ok(val) = capacity.parse::<u32>() {
                config.client.capacity = val;
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
        errors.extend(self.hub.validate());
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
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

/// Session hub configuration, shared by every session the hub owns
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HubConfig {
    /// Read timeout per frame; an idle session logs and keeps waiting
    #[serde(with = "duration_serde")]
    pub read_timeout: Duration,

    /// Write timeout per flushed batch; expiry closes the session
    #[serde(with = "duration_serde")]
    pub write_timeout: Duration,

    /// Upper bound on `Hub::exit` waiting for sessions to terminate
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Poll interval used by `Hub::exit`
    #[serde(with = "duration_serde")]
    pub exit_poll_interval: Duration,

    /// Trust `X-Forwarded-For` / `X-Real-Ip` when reporting client addresses
    pub forwarded_by_client_ip: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            read_timeout: timeout::SESSION_IO_TIMEOUT,
            write_timeout: timeout::SESSION_IO_TIMEOUT,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
            exit_poll_interval: Duration::from_millis(50),
            forwarded_by_client_ip: true,
        }
    }
}

impl HubConfig {
    /// Validate hub configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.read_timeout.as_millis() < 10 {
            errors.push("Read timeout too short (minimum: 10ms)".to_string());
        }

        if self.write_timeout.as_millis() < 10 {
            errors.push("Write timeout too short (minimum: 10ms)".to_string());
        }

        if self.shutdown_timeout > Duration::from_secs(300) {
            errors.push("Shutdown timeout too long (maximum: 300s)".to_string());
        }

        if self.exit_poll_interval.is_zero() {
            errors.push("Exit poll interval must be greater than 0".to_string());
        } else if self.exit_poll_interval > self.shutdown_timeout {
            errors.push("Exit poll interval cannot exceed the shutdown timeout".to_string());
        }

        errors
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Server listen address (e.g., "127.0.0.1:9000")
    pub address: String,

    /// Transport negotiated on accepted connections
    #[serde(default)]
    pub transport: TransportKind,

    /// Timeout for the TLS and WebSocket handshakes
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// PEM certificate chain; TLS is enabled when both paths are set
    #[serde(default)]
    pub cert_path: Option<String>,

    /// PEM (PKCS#8) private key
    #[serde(default)]
    pub key_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            transport: TransportKind::WebSocket,
            handshake_timeout: timeout::DEFAULT_TIMEOUT,
            cert_path: None,
            key_path: None,
        }
    }
}

impl ServerConfig {
    /// Whether both halves of the TLS material are configured
    pub fn tls_enabled(&self) -> bool {
        self.cert_path.is_some() && self.key_path.is_some()
    }

    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:8080')",
                self.address
            ));
        }

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        }

        if self.cert_path.is_some() != self.key_path.is_some() {
            errors.push("cert_path and key_path must be set together".to_string());
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Number of slots in the connection pool
    pub capacity: u32,

    /// Transport used when dialing
    #[serde(default)]
    pub transport: TransportKind,

    /// Timeout for connection attempts (dial + handshake)
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Timeout for waiting for response messages
    #[serde(with = "duration_serde")]
    pub response_timeout: Duration,

    /// Reconnect attempts a request makes before giving up
    pub max_reconnect_attempts: u32,

    /// Delay between reconnect attempts
    #[serde(with = "duration_serde")]
    pub reconnect_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CLIENT_CAPACITY,
            transport: TransportKind::WebSocket,
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            response_timeout: timeout::RESPONSE_TIMEOUT,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.capacity == 0 {
            errors.push("Client capacity must be greater than 0".to_string());
        } else if self.capacity > 65_535 {
            errors.push(format!(
                "Client capacity too large: {} (maximum: 65535)",
                self.capacity
            ));
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        }

        if self.response_timeout.as_millis() < 10 {
            errors.push("Response timeout too short (minimum: 10ms)".to_string());
        }

        if self.reconnect_delay > Duration::from_secs(60) {
            errors.push("Reconnect delay too long (maximum: 60s)".to_string());
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

    /// Whether to log to file instead of stdout
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("frame-session"),
            log_level: Level::INFO,
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
