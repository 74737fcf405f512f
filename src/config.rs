//! Dispatcher configuration
//!
//! Loaded from JSON text or a JSON file; every field has a default so an
//! empty object is a valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Connect timeout applied when none is configured
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 15_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Optional connection pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum connections per spec checked out at once
    pub max_open: usize,
    /// Maximum idle connections retained per spec
    pub max_idle: usize,
    /// Wait limit for a free slot; unset means wait indefinitely
    pub checkout_timeout_ms: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open: 4,
            max_idle: 2,
            checkout_timeout_ms: None,
        }
    }
}

impl PoolConfig {
    pub fn checkout_timeout(&self) -> Option<Duration> {
        self.checkout_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub connect_timeout_ms: u64,
    /// Per-statement limit; unset means statements may run indefinitely
    pub execute_timeout_ms: Option<u64>,
    /// Pin each new session to UTC when the engine supports it
    pub session_timezone_utc: bool,
    /// Reported to engines that accept a client/application name
    pub application_name: Option<String>,
    pub pool: Option<PoolConfig>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            execute_timeout_ms: None,
            session_timezone_utc: true,
            application_name: None,
            pool: None,
        }
    }
}

impl DispatchConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: DispatchConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::invalid("connect_timeout_ms", "must be greater than zero"));
        }
        if self.execute_timeout_ms == Some(0) {
            return Err(ConfigError::invalid("execute_timeout_ms", "must be greater than zero"));
        }
        if let Some(pool) = &self.pool {
            if pool.max_open == 0 {
                return Err(ConfigError::invalid("pool.max_open", "must be greater than zero"));
            }
            if pool.max_idle > pool.max_open {
                return Err(ConfigError::invalid(
                    "pool.max_idle",
                    format!("{} exceeds max_open ({})", pool.max_idle, pool.max_open),
                ));
            }
            if pool.checkout_timeout_ms == Some(0) {
                return Err(ConfigError::invalid(
                    "pool.checkout_timeout_ms",
                    "must be greater than zero",
                ));
            }
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn execute_timeout(&self) -> Option<Duration> {
        self.execute_timeout_ms.map(Duration::from_millis)
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = Some(pool);
        self
    }
}
