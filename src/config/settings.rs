//! Configuration structures for deserialisation.
//!
//! These structures map directly to the JSON configuration file format.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Root configuration structure.
///
/// This is the top-level structure that matches the JSON config file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Optional JSON schema reference (ignored during parsing).
    #[serde(rename = "$schema", default)]
    _schema: Option<String>,

    /// Optional comment field (ignored during parsing).
    #[serde(rename = "_comment", default)]
    _comment: Option<String>,

    /// Relay connection settings.
    #[serde(default)]
    pub relay: RelayConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation checks fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.relay.validate()
    }
}

/// Relay connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// WebSocket URL of the relay server.
    /// Default: `ws://localhost:3055`
    #[serde(default = "default_url")]
    pub url: String,

    /// Channel to join before the first command when none was joined
    /// explicitly.
    #[serde(default)]
    pub default_channel: Option<String>,

    /// Connection attempts per `connect()` before giving up.
    #[serde(default = "default_connect_max_attempts")]
    pub connect_max_attempts: u32,

    /// Pause between connection attempts in milliseconds.
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,

    /// How long to wait for a join acknowledgement in milliseconds.
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,

    /// Default command timeout in milliseconds.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Maximum number of outstanding commands (unlimited when absent).
    #[serde(default)]
    pub max_pending_requests: Option<usize>,

    /// Consecutive malformed frames that force the connection down.
    #[serde(default = "default_malformed_frame_limit")]
    pub malformed_frame_limit: u32,

    /// Largest `chunkCount` accepted for a chunked result.
    #[serde(default = "default_max_chunk_count")]
    pub max_chunk_count: usize,
}

impl RelayConfig {
    /// Pause between connection attempts.
    #[must_use]
    pub const fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    /// Join acknowledgement timeout.
    #[must_use]
    pub const fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Default command timeout.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Validates the relay settings.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.url.starts_with("ws://") {
            return Err(invalid(format!(
                "Invalid relay url '{}'. Must start with ws://",
                self.url
            )));
        }
        if self.connect_max_attempts == 0 {
            return Err(invalid("connect_max_attempts must be at least 1"));
        }
        if self.join_timeout_ms == 0 || self.command_timeout_ms == 0 {
            return Err(invalid("join_timeout_ms and command_timeout_ms must be positive"));
        }
        if self.malformed_frame_limit == 0 {
            return Err(invalid("malformed_frame_limit must be at least 1"));
        }
        if self.max_chunk_count == 0 {
            return Err(invalid("max_chunk_count must be at least 1"));
        }
        if self.max_pending_requests == Some(0) {
            return Err(invalid("max_pending_requests must be at least 1 when set"));
        }
        if self
            .default_channel
            .as_deref()
            .is_some_and(|c| c.trim().is_empty())
        {
            return Err(invalid("default_channel must not be empty when set"));
        }
        Ok(())
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            default_channel: None,
            connect_max_attempts: default_connect_max_attempts(),
            connect_backoff_ms: default_connect_backoff_ms(),
            join_timeout_ms: default_join_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            max_pending_requests: None,
            malformed_frame_limit: default_malformed_frame_limit(),
            max_chunk_count: default_max_chunk_count(),
        }
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        message: message.into(),
    }
}

fn default_url() -> String {
    "ws://localhost:3055".to_string()
}

const fn default_connect_max_attempts() -> u32 {
    3
}

const fn default_connect_backoff_ms() -> u64 {
    1000
}

const fn default_join_timeout_ms() -> u64 {
    10_000
}

const fn default_command_timeout_ms() -> u64 {
    30_000
}

const fn default_malformed_frame_limit() -> u32 {
    5
}

const fn default_max_chunk_count() -> usize {
    10_000
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}
