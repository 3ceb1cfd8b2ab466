//! Queue configuration loaded from the environment.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `DATABASE_URL` | unset: in-memory store |
//! | `INGESTQ_DB_MAX_CONNECTIONS` | `10` |
//! | `INGESTQ_MAX_ATTEMPTS` | `5` |
//! | `INGESTQ_BASE_DELAY_SECS` | `60` |
//! | `INGESTQ_MAX_DELAY_SECS` | `3600` |
//! | `INGESTQ_LEASE_TTL_SECS` | `900` |
//! | `INGESTQ_SWEEP_INTERVAL_SECS` | `60` |
//! | `INGESTQ_POLL_INTERVAL_MS` | `1000` |
//! | `INGESTQ_CONCURRENCY` | `4` |
//! | `INGESTQ_NOTIFY_CHANNEL` | `ingest_jobs` |

use std::str::FromStr;
use std::time::Duration;

use crate::jobs::executor::WorkerPoolConfig;
use crate::jobs::postgres::DEFAULT_NOTIFY_CHANNEL;
use crate::jobs::sweeper::SweeperConfig;
use crate::jobs::types::RetryPolicy;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var} ({value:?}): {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(var: &'static str, value: impl ToString, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub retry: RetryPolicy,
    pub lease_ttl: Duration,
    pub sweep_interval: Duration,
    pub poll_interval: Duration,
    pub concurrency: usize,
    pub notify_channel: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: 10,
            retry: RetryPolicy::default(),
            lease_ttl: Duration::from_secs(900),
            sweep_interval: Duration::from_secs(60),
            poll_interval: Duration::from_millis(1000),
            concurrency: 4,
            notify_channel: DEFAULT_NOTIFY_CHANNEL.to_string(),
        }
    }
}

impl QueueConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to resolve variable names; unset or blank values
    /// fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let config = Self {
            database_url: get("DATABASE_URL"),
            db_max_connections: parse_or(
                "INGESTQ_DB_MAX_CONNECTIONS",
                get("INGESTQ_DB_MAX_CONNECTIONS"),
                defaults.db_max_connections,
            )?,
            retry: RetryPolicy::new(
                parse_or(
                    "INGESTQ_MAX_ATTEMPTS",
                    get("INGESTQ_MAX_ATTEMPTS"),
                    defaults.retry.max_attempts,
                )?,
                Duration::from_secs(parse_or(
                    "INGESTQ_BASE_DELAY_SECS",
                    get("INGESTQ_BASE_DELAY_SECS"),
                    defaults.retry.base_delay.as_secs(),
                )?),
                Duration::from_secs(parse_or(
                    "INGESTQ_MAX_DELAY_SECS",
                    get("INGESTQ_MAX_DELAY_SECS"),
                    defaults.retry.max_delay.as_secs(),
                )?),
            ),
            lease_ttl: Duration::from_secs(parse_or(
                "INGESTQ_LEASE_TTL_SECS",
                get("INGESTQ_LEASE_TTL_SECS"),
                defaults.lease_ttl.as_secs(),
            )?),
            sweep_interval: Duration::from_secs(parse_or(
                "INGESTQ_SWEEP_INTERVAL_SECS",
                get("INGESTQ_SWEEP_INTERVAL_SECS"),
                defaults.sweep_interval.as_secs(),
            )?),
            poll_interval: Duration::from_millis(parse_or(
                "INGESTQ_POLL_INTERVAL_MS",
                get("INGESTQ_POLL_INTERVAL_MS"),
                1000,
            )?),
            concurrency: parse_or(
                "INGESTQ_CONCURRENCY",
                get("INGESTQ_CONCURRENCY"),
                defaults.concurrency,
            )?,
            notify_channel: get("INGESTQ_NOTIFY_CHANNEL").unwrap_or(defaults.notify_channel),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "INGESTQ_MAX_ATTEMPTS",
                self.retry.max_attempts,
                "must be at least 1",
            ));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::invalid(
                "INGESTQ_BASE_DELAY_SECS",
                self.retry.base_delay.as_secs(),
                format!(
                    "must not exceed INGESTQ_MAX_DELAY_SECS ({})",
                    self.retry.max_delay.as_secs()
                ),
            ));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::invalid("INGESTQ_CONCURRENCY", 0, "must be at least 1"));
        }
        if self.db_max_connections == 0 {
            return Err(ConfigError::invalid(
                "INGESTQ_DB_MAX_CONNECTIONS",
                0,
                "must be at least 1",
            ));
        }
        for (var, value) in [
            ("INGESTQ_LEASE_TTL_SECS", self.lease_ttl),
            ("INGESTQ_SWEEP_INTERVAL_SECS", self.sweep_interval),
            ("INGESTQ_POLL_INTERVAL_MS", self.poll_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::invalid(var, 0, "must be positive"));
            }
        }
        if !is_valid_channel(&self.notify_channel) {
            return Err(ConfigError::invalid(
                "INGESTQ_NOTIFY_CHANNEL",
                &self.notify_channel,
                "must be a plain identifier (letters, digits, underscore)",
            ));
        }
        Ok(())
    }

    pub fn sweeper(&self) -> SweeperConfig {
        SweeperConfig::default()
            .with_interval(self.sweep_interval)
            .with_lease_ttl(self.lease_ttl)
    }

    pub fn worker_pool(&self, name: impl Into<String>) -> WorkerPoolConfig {
        WorkerPoolConfig::default()
            .with_name(name)
            .with_concurrency(self.concurrency)
            .with_poll_interval(self.poll_interval)
    }
}

fn parse_or<T>(var: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => raw
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(var, &raw, e.to_string())),
        None => Ok(default),
    }
}

fn is_valid_channel(channel: &str) -> bool {
    !channel.is_empty()
        && channel.len() <= 63
        && channel
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !channel.starts_with(|c: char| c.is_ascii_digit())
}
