//! Room Controller configuration.
//!
//! Configuration is loaded from environment variables.

use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default controller instance id.
pub const DEFAULT_CONTROLLER_ID: &str = "room-controller";

/// Default per-engine element ceiling.
pub const DEFAULT_ENGINE_MAX_ELEMENTS: usize = 10_000;

/// Default capacity of each room's engine event channel.
pub const DEFAULT_EVENT_CHANNEL_BUFFER: usize = 256;

/// Default bound on closing one room during shutdown, in seconds.
pub const DEFAULT_RELEASE_TIMEOUT_SECONDS: u64 = 5;

/// Room Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier of this controller instance (used in logs).
    pub controller_id: String,

    /// Engine URIs, one pooled instance each, in pool order.
    pub engine_uris: Vec<String>,

    /// Element ceiling applied to every engine instance (default: 10000).
    pub engine_max_elements: usize,

    /// Capacity of each room's engine event channel (default: 256).
    pub event_channel_buffer: usize,

    /// Bound on closing one room during `close_all` (default: 5).
    pub release_timeout_seconds: u64,

    /// Requester ids placed on the privileged tier. Empty disables the tier.
    pub privileged_requesters: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let engine_uris = split_list(
            vars.get("ROOM_ENGINE_URIS")
                .ok_or_else(|| ConfigError::MissingEnvVar("ROOM_ENGINE_URIS".to_string()))?,
        );
        if engine_uris.is_empty() {
            return Err(ConfigError::InvalidValue(
                "ROOM_ENGINE_URIS must name at least one engine".to_string(),
            ));
        }

        let controller_id = vars
            .get("ROOM_CONTROLLER_ID")
            .cloned()
            .unwrap_or_else(|| DEFAULT_CONTROLLER_ID.to_string());

        let engine_max_elements = parse_or(
            vars,
            "ROOM_ENGINE_MAX_ELEMENTS",
            DEFAULT_ENGINE_MAX_ELEMENTS,
        )?;

        let event_channel_buffer = parse_or(
            vars,
            "ROOM_EVENT_CHANNEL_BUFFER",
            DEFAULT_EVENT_CHANNEL_BUFFER,
        )?;
        // tokio::sync::mpsc::channel panics on zero capacity
        if event_channel_buffer == 0 {
            return Err(ConfigError::InvalidValue(
                "ROOM_EVENT_CHANNEL_BUFFER must be greater than zero".to_string(),
            ));
        }

        let release_timeout_seconds = parse_or(
            vars,
            "ROOM_RELEASE_TIMEOUT_SECONDS",
            DEFAULT_RELEASE_TIMEOUT_SECONDS,
        )?;

        let privileged_requesters = vars
            .get("ROOM_PRIVILEGED_REQUESTERS")
            .map(|s| split_list(s))
            .unwrap_or_default();

        Ok(Config {
            controller_id,
            engine_uris,
            engine_max_elements,
            event_channel_buffer,
            release_timeout_seconds,
            privileged_requesters,
        })
    }

    #[must_use]
    pub fn release_timeout(&self) -> Duration {
        Duration::from_secs(self.release_timeout_seconds)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_or<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw}"))),
    }
}
