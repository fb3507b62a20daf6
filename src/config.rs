//! # Configuration Management
//!
//! Centralized configuration for the session layer.
//!
//! This module provides structured configuration for sessions, the moderation
//! policy, the frame buffer pool and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides (`PEER_SESSION_*`)
//!
//! ## Moderation
//! `moderation.strike_threshold` is the accumulated unforgiven strike weight at
//! which a session is disconnected. The default of 1 disconnects on every
//! unforgiven strike.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::Level;

/// Max allowed inbound payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Weight of strikes issued for malformed frames and disallowed commands
pub const PROTOCOL_VIOLATION_WEIGHT: u32 = 5;

/// Weight of plugin-initiated strikes that do not specify one
pub const DEFAULT_STRIKE_WEIGHT: u32 = 1;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Per-session framing settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Strike policy
    #[serde(default)]
    pub moderation: ModerationConfig,

    /// Frame buffer pool
    #[serde(default)]
    pub buffers: BufferConfig,

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

        if let Ok(value) = std::env::var("PEER_SESSION_VALIDATE_HEADERS") {
            if let Ok(val) = value.parse::<bool>() {
                config.session.validate_headers = val;
            }
        }

        if let Ok(value) = std::env::var("PEER_SESSION_MAX_PAYLOAD_SIZE") {
            if let Ok(val) = value.parse::<usize>() {
                config.session.max_payload_size = val;
            }
        }

        if let Ok(value) = std::env::var("PEER_SESSION_STRIKE_THRESHOLD") {
            if let Ok(val) = value.parse::<u32>() {
                config.moderation.strike_threshold = val;
            }
        }

        if let Ok(value) = std::env::var("PEER_SESSION_BUFFER_POOL_SIZE") {
            if let Ok(val) = value.parse::<usize>() {
                config.buffers.pool_size = val;
            }
        }

        if let Ok(value) = std::env::var("PEER_SESSION_LOG_LEVEL") {
            if let Ok(level) = value.parse::<Level>() {
                config.logging.log_level = level;
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
        errors.extend(self.session.validate());
        errors.extend(self.moderation.validate());
        errors.extend(self.buffers.validate());
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

/// Per-session framing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Reject inbound frames whose header is inconsistent (unknown delivery mode,
    /// declared length different from the bytes received)
    pub validate_headers: bool,

    /// Largest inbound payload accepted; anything bigger is an invalid frame
    pub max_payload_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            validate_headers: true,
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }
}

impl SessionConfig {
    /// Validate session configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_payload_size == 0 {
            errors.push("Max payload size cannot be 0".to_string());
        } else if self.max_payload_size > u32::MAX as usize {
            errors.push(format!(
                "Max payload size too large: {} bytes (header length field is 32 bits)",
                self.max_payload_size
            ));
        }

        errors
    }
}

/// Strike policy configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModerationConfig {
    /// Accumulated unforgiven weight that triggers disconnection
    pub strike_threshold: u32,

    /// Weight used for malformed frames and disallowed commands
    pub protocol_violation_weight: u32,

    /// Weight used for plugin strikes that give none
    pub default_strike_weight: u32,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            strike_threshold: 1,
            protocol_violation_weight: PROTOCOL_VIOLATION_WEIGHT,
            default_strike_weight: DEFAULT_STRIKE_WEIGHT,
        }
    }
}

impl ModerationConfig {
    /// Validate moderation configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.strike_threshold == 0 {
            errors.push("Strike threshold must be greater than 0".to_string());
        }

        if self.protocol_violation_weight < self.strike_threshold {
            errors.push(format!(
                "Protocol violation weight ({}) is below the strike threshold ({}): malformed frames would not disconnect on their own",
                self.protocol_violation_weight, self.strike_threshold
            ));
        }

        if self.default_strike_weight == 0 {
            errors.push("Default strike weight must be greater than 0".to_string());
        }

        errors
    }
}

/// Frame buffer pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BufferConfig {
    /// Buffers pre-allocated at startup
    pub pool_size: usize,

    /// Initial capacity of each buffer in bytes
    pub buffer_capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            pool_size: 50,
            buffer_capacity: 1024,
        }
    }
}

impl BufferConfig {
    /// Validate buffer configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.buffer_capacity < 16 {
            errors.push("Buffer capacity too small (minimum: 16 bytes)".to_string());
        } else if self.buffer_capacity > 1024 * 1024 {
            errors.push(format!(
                "Buffer capacity too large: {} bytes (maximum: 1 MB)",
                self.buffer_capacity
            ));
        }

        if self.pool_size > 100_000 {
            errors.push(format!(
                "Buffer pool very large: {} (ensure system memory can support this)",
                self.pool_size
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

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("peer-session"),
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
