//! Per-connection protocol settings.
//!
//! # Environment
//!
//! | variable                 | effect                                   |
//! |--------------------------|------------------------------------------|
//! | `RPCWIRE_BODY_ONLY`      | `1`/`true`: write JSON without headers   |
//! | `RPCWIRE_MAX_FRAME_SIZE` | cap on a single frame, in bytes          |
//! | `RPCWIRE_MAX_WORKERS`    | size of the blocking worker pool         |

use thiserror::Error;

use crate::wire::framing::{FramingMode, DEFAULT_MAX_FRAME_SIZE};

/// Default number of blocking workers.
pub const DEFAULT_MAX_WORKERS: usize = 2;

pub const ENV_BODY_ONLY: &str = "RPCWIRE_BODY_ONLY";
pub const ENV_MAX_FRAME_SIZE: &str = "RPCWIRE_MAX_FRAME_SIZE";
pub const ENV_MAX_WORKERS: &str = "RPCWIRE_MAX_WORKERS";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// How outgoing messages are framed.
    pub framing: FramingMode,
    /// Largest accepted incoming frame, in bytes.
    pub max_frame_size: usize,
    /// Concurrent blocking handlers.
    pub max_workers: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            framing: FramingMode::Headers,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

impl ProtocolConfig {
    /// Read overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for values that do not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read overrides through `lookup`; unset variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_BODY_ONLY) {
            config.framing = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => FramingMode::BodyOnly,
                "0" | "false" | "no" | "" => FramingMode::Headers,
                _ => {
                    return Err(ConfigError::Invalid {
                        name: ENV_BODY_ONLY,
                        value,
                        reason: "expected a boolean",
                    })
                }
            };
        }

        if let Some(value) = lookup(ENV_MAX_FRAME_SIZE) {
            config.max_frame_size = parse_positive(ENV_MAX_FRAME_SIZE, value)?;
        }

        if let Some(value) = lookup(ENV_MAX_WORKERS) {
            config.max_workers = parse_positive(ENV_MAX_WORKERS, value)?;
        }

        Ok(config)
    }
}

fn parse_positive(name: &'static str, value: String) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(0) => Err(ConfigError::Invalid {
            name,
            value,
            reason: "must be greater than zero",
        }),
        Ok(n) => Ok(n),
        Err(_) => Err(ConfigError::Invalid {
            name,
            value,
            reason: "expected a positive integer",
        }),
    }
}
