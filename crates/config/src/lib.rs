//! Configuration loading for lockstep replicas.
//!
//! [`Settings`] holds the recognized `general.*` keys with their defaults.
//! Values can be replaced programmatically with [`Settings::set`], and every
//! key can be overridden by an environment variable: uppercase the key,
//! replace dots with underscores, and prefix with `CORE_PBFT_`
//! (`general.mode` → `CORE_PBFT_GENERAL_MODE`). Environment overrides are
//! resolved at read time, so they win over both defaults and `set`.

use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "CORE_PBFT_";

/// Errors raised when reading typed configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("configuration key {0} is not set")]
    MissingKey(String),

    #[error("configuration key {key} has invalid value {value:?}: expected {expected}")]
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Key/value configuration with defaults and environment overrides.
#[derive(Debug, Clone)]
pub struct Settings {
    values: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self::load()
    }
}

impl Settings {
    /// Load the default configuration.
    pub fn load() -> Self {
        let mut values = BTreeMap::new();
        let defaults: &[(&str, &str)] = &[
            ("general.mode", "classic"),
            ("general.N", "4"),
            ("general.f", "1"),
            ("general.K", "10"),
            ("general.logmultiplier", "4"),
            ("general.viewchangeperiod", "0"),
            ("general.timeout.request", "2s"),
            ("general.timeout.viewchange", "2s"),
            ("general.timeout.nullrequest", "0"),
            ("general.timeout.resendviewchange", "1s"),
        ];
        for (k, v) in defaults {
            values.insert((*k).to_string(), (*v).to_string());
        }
        Self { values }
    }

    /// Replace a value programmatically. The key need not be a default key.
    pub fn set(&mut self, key: &str, value: impl ToString) {
        self.values.insert(key.to_string(), value.to_string());
    }

    /// Whether `key` has a value (default, `set`, or environment override).
    pub fn is_set(&self, key: &str) -> bool {
        env_override(key).is_some() || self.values.contains_key(key)
    }

    /// Read a value as a string, honoring environment overrides.
    pub fn get_string(&self, key: &str) -> Option<String> {
        if let Some(v) = env_override(key) {
            debug!(key, value = %v, "configuration key overridden from environment");
            return Some(v);
        }
        self.values.get(key).cloned()
    }

    /// Read a value as an unsigned integer.
    pub fn get_u64(&self, key: &str) -> Result<u64, ConfigError> {
        let value = self
            .get_string(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))?;
        value.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
            expected: "unsigned integer",
        })
    }

    /// Read a value as a duration.
    ///
    /// Accepts `ms`, `s`, and `m` suffixes; a bare number is seconds, and
    /// `0` disables the corresponding timer.
    pub fn get_duration(&self, key: &str) -> Result<Duration, ConfigError> {
        let value = self
            .get_string(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))?;
        parse_duration(&value).ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
            expected: "duration such as 500ms, 2s or 1m",
        })
    }
}

/// Resolve the environment override for a key, if any.
fn env_override(key: &str) -> Option<String> {
    let name = format!(
        "{}{}",
        ENV_PREFIX,
        key.to_uppercase().replace('.', "_")
    );
    std::env::var(name).ok()
}

fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Some(ms) = value.strip_suffix("ms") {
        return ms.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(m) = value.strip_suffix('m') {
        return m.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60));
    }
    if let Some(s) = value.strip_suffix('s') {
        return s.trim().parse::<u64>().ok().map(Duration::from_secs);
    }
    value.parse::<u64>().ok().map(Duration::from_secs)
}
