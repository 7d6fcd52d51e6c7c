//! Client and promoter configuration.
//!
//! Values come from `DELAYER_*` environment variables; anything unset keeps
//! its default. The same structs deserialize from any serde format.

use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::pool::PoolOptions;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Connection settings for the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Logical database index selected on every new connection.
    pub database: i64,
    pub password: Option<String>,
    pub max_idle: usize,
    /// 0 = unbounded.
    pub max_active: usize,
    /// 0 = idle connections never time out.
    pub idle_timeout_secs: u64,
    /// 0 = connections are never recycled for age.
    pub conn_max_lifetime_secs: u64,
    /// Wait for a free connection when `max_active` is reached.
    pub wait: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            database: 0,
            password: None,
            max_idle: 10,
            max_active: 0,
            idle_timeout_secs: 300,
            conn_max_lifetime_secs: 0,
            wait: true,
        }
    }
}

impl ClientConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (the environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(host) = lookup("DELAYER_REDIS_HOST") {
            config.host = host;
        }
        parse_into(&lookup, "DELAYER_REDIS_PORT", &mut config.port)?;
        parse_into(&lookup, "DELAYER_REDIS_DB", &mut config.database)?;
        if let Some(password) = lookup("DELAYER_REDIS_PASSWORD") {
            config.password = (!password.is_empty()).then_some(password);
        }
        parse_into(&lookup, "DELAYER_REDIS_MAX_IDLE", &mut config.max_idle)?;
        parse_into(&lookup, "DELAYER_REDIS_MAX_ACTIVE", &mut config.max_active)?;
        parse_into(&lookup, "DELAYER_REDIS_IDLE_TIMEOUT", &mut config.idle_timeout_secs)?;
        parse_into(
            &lookup,
            "DELAYER_REDIS_CONN_MAX_LIFETIME",
            &mut config.conn_max_lifetime_secs,
        )?;
        parse_into(&lookup, "DELAYER_REDIS_WAIT", &mut config.wait)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be greater than 0".into()));
        }
        if self.database < 0 {
            return Err(ConfigError::Invalid("database index must not be negative".into()));
        }
        if self.max_active > 0 && self.max_idle > self.max_active {
            return Err(ConfigError::Invalid(format!(
                "max_idle ({}) must not exceed max_active ({})",
                self.max_idle, self.max_active
            )));
        }
        Ok(())
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            max_idle: self.max_idle,
            max_active: self.max_active,
            idle_timeout: non_zero_secs(self.idle_timeout_secs),
            max_lifetime: non_zero_secs(self.conn_max_lifetime_secs),
            wait: self.wait,
        }
    }
}

/// Promoter loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PromoterConfig {
    /// Name for logging and the worker thread.
    pub name: String,
    /// Pause between scans that found nothing due.
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    /// Maximum entries moved per store call.
    pub batch_size: usize,
}

impl Default for PromoterConfig {
    fn default() -> Self {
        Self {
            name: "delayer-promoter".to_string(),
            poll_interval: Duration::from_millis(1000),
            batch_size: 100,
        }
    }
}

impl PromoterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(name) = lookup("DELAYER_PROMOTER_NAME") {
            config.name = name;
        }
        let mut interval_ms = u64::try_from(config.poll_interval.as_millis()).unwrap_or(u64::MAX);
        parse_into(&lookup, "DELAYER_PROMOTER_INTERVAL_MS", &mut interval_ms)?;
        config.poll_interval = Duration::from_millis(interval_ms);
        parse_into(&lookup, "DELAYER_PROMOTER_BATCH_SIZE", &mut config.batch_size)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "poll_interval must be greater than 0".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be greater than 0".into()));
        }
        Ok(())
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn parse_into<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *slot = raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
