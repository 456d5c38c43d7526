//! Configuration management for cdp-mux

use crate::{Error, Result};
use serde::Deserialize;
use std::env;
use std::time::Duration;

/// Macro for parsing environment variables with type safety and consistent error handling
macro_rules! parse_env_var {
    ($config:ident, $field:ident, $env_var:expr, $ty:ty) => {
        if let Ok(value) = env::var($env_var) {
            $config.$field = value
                .parse::<$ty>()
                .map_err(|_| Error::invalid_argument(concat!("Invalid ", $env_var)))?;
        }
    };
}

/// Client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Default wait for a command response when the caller gave no timeout,
    /// in seconds
    pub default_command_timeout_secs: u64,

    /// Interval at which `handle_events_until` re-polls its predicate while
    /// no message arrives, in milliseconds
    pub poll_interval_ms: u64,

    /// Connect attempts after the frontend closer ran (the first failed
    /// attempt is not counted)
    pub connect_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Matches the renderer-side worst case for long commands such
            // as tracing collection.
            default_command_timeout_secs: 600,
            poll_interval_ms: 500,
            connect_retries: 1,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        parse_env_var!(config, default_command_timeout_secs, "CDPMUX_COMMAND_TIMEOUT", u64);
        parse_env_var!(config, poll_interval_ms, "CDPMUX_POLL_INTERVAL_MS", u64);
        parse_env_var!(config, connect_retries, "CDPMUX_CONNECT_RETRIES", u32);

        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::unknown(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::unknown(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Default wait applied to `send_command` calls without an explicit deadline
    pub fn default_command_timeout(&self) -> Duration {
        Duration::from_secs(self.default_command_timeout_secs)
    }

    /// Predicate re-poll interval for `handle_events_until`
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
