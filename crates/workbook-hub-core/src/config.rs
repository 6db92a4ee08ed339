//! Hub configuration.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Top-level hub configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub session: SessionConfig,
    pub transport: TransportConfig,
}

impl HubConfig {
    /// Parse configuration from TOML, filling unspecified values with defaults.
    ///
    /// # Errors
    /// Returns error if the TOML is malformed or a value is out of range.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Check value ranges.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.client_buffer == 0 || self.session.agent_buffer == 0 {
            return Err(ConfigError::Invalid("buffers must hold at least one message".into()));
        }
        if self.session.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid("sweep_interval_ms must be positive".into()));
        }
        if self.transport.heartbeat_interval_ms == 0
            || self.transport.heartbeat_timeout_ms <= self.transport.heartbeat_interval_ms
        {
            return Err(ConfigError::Invalid(
                "heartbeat_timeout_ms must exceed a positive heartbeat_interval_ms".into(),
            ));
        }
        if self.transport.max_frame_bytes < 64 {
            return Err(ConfigError::Invalid("max_frame_bytes is too small".into()));
        }
        Ok(())
    }
}

/// Session lifecycle settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a session may go without its agent (or without anyone)
    /// before it is closed.
    pub grace_period_ms: u64,
    /// How often the idle sweeper runs.
    pub sweep_interval_ms: u64,
    /// Outbound events buffered per client before it is disconnected.
    pub client_buffer: usize,
    /// Requests in flight to the agent at once. Later requests wait in the
    /// session queue until earlier ones complete.
    pub agent_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 30_000,
            sweep_interval_ms: 5_000,
            client_buffer: 256,
            agent_buffer: 256,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Per-connection transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 15_000,
            handshake_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
            max_frame_bytes: 1024 * 1024,
        }
    }
}

impl TransportConfig {
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub const fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    #[must_use]
    pub const fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}
