// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

use crate::cleanup::RetentionWorkerConfig;
use crate::deadline::DeadlineSchedulerConfig;
use crate::engine::{DEFAULT_DIRECT_TIMEOUT, DEFAULT_TRANSITION_RETRIES};

/// Stagecraft configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL or path
    pub database_url: String,
    /// Compare-and-swap attempts per transition
    pub transition_retries: u32,
    /// How long a direct create waits for the first transition
    pub direct_timeout: Duration,
    /// Deadline scheduler settings
    pub deadline: DeadlineSchedulerConfig,
    /// Retention worker settings
    pub retention: RetentionWorkerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `STAGECRAFT_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `STAGECRAFT_TRANSITION_RETRIES`: attempts per transition (default: 3)
    /// - `STAGECRAFT_DIRECT_TIMEOUT_MS`: direct create wait (default: 30000)
    /// - `STAGECRAFT_DEADLINE_*`: see [`DeadlineSchedulerConfig::from_env`]
    /// - `STAGECRAFT_RETENTION_*`: see [`RetentionWorkerConfig::from_env`]
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("STAGECRAFT_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("STAGECRAFT_DATABASE_URL"))?;

        let transition_retries: u32 = match std::env::var("STAGECRAFT_TRANSITION_RETRIES") {
            Ok(v) => v.parse().ok().filter(|n| *n > 0).ok_or(ConfigError::Invalid(
                "STAGECRAFT_TRANSITION_RETRIES",
                "must be a positive integer",
            ))?,
            Err(_) => DEFAULT_TRANSITION_RETRIES,
        };

        let direct_timeout = match std::env::var("STAGECRAFT_DIRECT_TIMEOUT_MS") {
            Ok(v) => Duration::from_millis(v.parse().map_err(|_| {
                ConfigError::Invalid("STAGECRAFT_DIRECT_TIMEOUT_MS", "must be milliseconds")
            })?),
            Err(_) => DEFAULT_DIRECT_TIMEOUT,
        };

        Ok(Self {
            database_url,
            transition_retries,
            direct_timeout,
            deadline: DeadlineSchedulerConfig::from_env(),
            retention: RetentionWorkerConfig::from_env(),
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
