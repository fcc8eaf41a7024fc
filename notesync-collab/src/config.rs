//! Server configuration.
//!
//! Loaded from a TOML file; every field falls back to its default when
//! omitted, so an empty file is a valid configuration.
//!
//! ```toml
//! bind_addr = "0.0.0.0:1234"
//! path_prefix = "/notes/"
//! eviction_grace_ms = 5000
//! idle_timeout_secs = 300
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Longest accepted idle timeout (one week).
pub const MAX_IDLE_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Fixed path prefix preceding the document name in the upgrade URL
    pub path_prefix: String,
    /// Relay channel capacity per document
    pub broadcast_capacity: usize,
    /// Delay between a document emptying and its eviction
    pub eviction_grace_ms: u64,
    /// Sessions with no inbound traffic for this long are closed
    pub idle_timeout_secs: u64,
    /// Maximum sessions attached to a single document
    pub max_sessions_per_document: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1234".to_string(),
            path_prefix: "/notes/".to_string(),
            broadcast_capacity: 256,
            eviction_grace_ms: 5_000,
            idle_timeout_secs: 300,
            max_sessions_per_document: 100,
        }
    }
}

impl ServerConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path_prefix.len() < 2
            || !self.path_prefix.starts_with('/')
            || !self.path_prefix.ends_with('/')
        {
            return Err(ConfigError::Invalid {
                field: "path_prefix",
                reason: format!("expected '/segment/', got {:?}", self.path_prefix),
            });
        }
        if self.broadcast_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "broadcast_capacity",
                reason: "must be greater than zero".into(),
            });
        }
        if self.idle_timeout_secs == 0 || self.idle_timeout_secs > MAX_IDLE_TIMEOUT_SECS {
            return Err(ConfigError::Invalid {
                field: "idle_timeout_secs",
                reason: format!("must be between 1 and {MAX_IDLE_TIMEOUT_SECS}"),
            });
        }
        if self.max_sessions_per_document == 0 {
            return Err(ConfigError::Invalid {
                field: "max_sessions_per_document",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    pub fn eviction_grace(&self) -> Duration {
        Duration::from_millis(self.eviction_grace_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}
