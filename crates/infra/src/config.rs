//! Configuration loading and representation.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::projections::DEFAULT_BATCH_SIZE;
use crate::query_cache::DEFAULT_CAPACITY;
use crate::router::{RetryPolicy, RouterSettings};

pub const ENV_DATA_DIR: &str = "STOCKLENS_DATA_DIR";
pub const ENV_BATCH_SIZE: &str = "STOCKLENS_BATCH_SIZE";
pub const ENV_ACK_TIMEOUT_MS: &str = "STOCKLENS_ACK_TIMEOUT_MS";
pub const ENV_RETRY_MAX_ATTEMPTS: &str = "STOCKLENS_RETRY_MAX_ATTEMPTS";
pub const ENV_RETRY_BASE_MS: &str = "STOCKLENS_RETRY_BASE_MS";
pub const ENV_RETRY_MAX_MS: &str = "STOCKLENS_RETRY_MAX_MS";
pub const ENV_CACHE_CAPACITY: &str = "STOCKLENS_CACHE_CAPACITY";
pub const ENV_WORKER_TICK_MS: &str = "STOCKLENS_WORKER_TICK_MS";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}={value:?} is invalid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Event core settings.
///
/// `data_dir` selects the durable file log; without it the store is in-memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub data_dir: Option<PathBuf>,
    pub batch_size: usize,
    pub ack_timeout_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub cache_capacity: usize,
    pub worker_tick_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            batch_size: DEFAULT_BATCH_SIZE,
            ack_timeout_ms: 30_000,
            retry_max_attempts: 5,
            retry_base_ms: 500,
            retry_max_ms: 60_000,
            cache_capacity: DEFAULT_CAPACITY,
            worker_tick_ms: 500,
        }
    }
}

impl CoreConfig {
    /// Read `STOCKLENS_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`CoreConfig::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|d| !d.trim().is_empty()) {
            config.data_dir = Some(PathBuf::from(dir));
        }
        read(&lookup, ENV_BATCH_SIZE, &mut config.batch_size)?;
        read(&lookup, ENV_ACK_TIMEOUT_MS, &mut config.ack_timeout_ms)?;
        read(&lookup, ENV_RETRY_MAX_ATTEMPTS, &mut config.retry_max_attempts)?;
        read(&lookup, ENV_RETRY_BASE_MS, &mut config.retry_base_ms)?;
        read(&lookup, ENV_RETRY_MAX_MS, &mut config.retry_max_ms)?;
        read(&lookup, ENV_CACHE_CAPACITY, &mut config.cache_capacity)?;
        read(&lookup, ENV_WORKER_TICK_MS, &mut config.worker_tick_ms)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            (ENV_BATCH_SIZE, self.batch_size as u64),
            (ENV_ACK_TIMEOUT_MS, self.ack_timeout_ms),
            (ENV_RETRY_MAX_ATTEMPTS, u64::from(self.retry_max_attempts)),
            (ENV_CACHE_CAPACITY, self.cache_capacity as u64),
            (ENV_WORKER_TICK_MS, self.worker_tick_ms),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    value: value.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.retry_max_ms < self.retry_base_ms {
            return Err(ConfigError::Invalid {
                key: ENV_RETRY_MAX_MS,
                value: self.retry_max_ms.to_string(),
                reason: format!("must be at least {ENV_RETRY_BASE_MS} ({})", self.retry_base_ms),
            });
        }
        Ok(())
    }

    pub fn worker_tick(&self) -> Duration {
        Duration::from_millis(self.worker_tick_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_base_ms),
            Duration::from_millis(self.retry_max_ms),
        )
    }

    pub fn router_settings(&self) -> RouterSettings {
        RouterSettings {
            batch_size: self.batch_size,
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            retry: self.retry_policy(),
            idle_tick: self.worker_tick(),
        }
    }
}

fn read<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(());
    };
    *slot = raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: raw.clone(),
        reason: e.to_string(),
    })?;
    Ok(())
}
