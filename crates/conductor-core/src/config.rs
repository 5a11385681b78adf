//! Scheduler configuration, loaded from TOML with environment overrides.
//!
//! ```toml
//! lease_ttl_ms = 30000
//! heartbeat_timeout_ms = 15000
//! max_tasks_per_objective = 20
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 2000
//! multiplier = 2.0
//! max_delay_ms = 600000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,

    /// Defaults to a quarter of the lease TTL.
    #[serde(default)]
    pub sweep_interval_ms: Option<u64>,

    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    #[serde(default = "default_max_tasks_per_objective")]
    pub max_tasks_per_objective: usize,

    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Upper bound for timeouts, one year.
const MAX_DURATION_MS: u64 = 365 * 24 * 60 * 60 * 1000;

fn default_lease_ttl_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    15_000
}

fn default_max_tasks_per_objective() -> usize {
    20
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    600_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms: default_lease_ttl_ms(),
            sweep_interval_ms: None,
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            max_tasks_per_objective: default_max_tasks_per_objective(),
            retry: RetryConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Parse config from a TOML string, then apply environment overrides.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// - `CONDUCTOR_LEASE_TTL_MS` -> `lease_ttl_ms`
    /// - `CONDUCTOR_HEARTBEAT_TIMEOUT_MS` -> `heartbeat_timeout_ms`
    /// - `CONDUCTOR_MAX_ATTEMPTS` -> `retry.max_attempts`
    ///
    /// Unparseable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub(crate) fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("CONDUCTOR_LEASE_TTL_MS")
            && let Ok(ms) = v.parse()
        {
            self.lease_ttl_ms = ms;
        }
        if let Some(v) = lookup("CONDUCTOR_HEARTBEAT_TIMEOUT_MS")
            && let Ok(ms) = v.parse()
        {
            self.heartbeat_timeout_ms = ms;
        }
        if let Some(v) = lookup("CONDUCTOR_MAX_ATTEMPTS")
            && let Ok(n) = v.parse()
        {
            self.retry.max_attempts = n;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_ttl_ms == 0 {
            return Err(ConfigError::Invalid("lease_ttl_ms must be > 0".into()));
        }
        if self.lease_ttl_ms > MAX_DURATION_MS || self.heartbeat_timeout_ms > MAX_DURATION_MS {
            return Err(ConfigError::Invalid(
                "lease_ttl_ms and heartbeat_timeout_ms must not exceed one year".into(),
            ));
        }
        if self.sweep_interval_ms == Some(0) {
            return Err(ConfigError::Invalid("sweep_interval_ms must be > 0".into()));
        }
        if self.heartbeat_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_timeout_ms must be > 0".into(),
            ));
        }
        if self.max_tasks_per_objective == 0 {
            return Err(ConfigError::Invalid(
                "max_tasks_per_objective must be > 0".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be >= 1".into(),
            ));
        }
        if !(self.retry.multiplier >= 1.0) {
            return Err(ConfigError::Invalid(
                "retry.multiplier must be >= 1.0".into(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        let ms = self
            .sweep_interval_ms
            .unwrap_or(self.lease_ttl_ms / 4)
            .max(1);
        Duration::from_millis(ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            multiplier: self.retry.multiplier,
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let config: SchedulerConfig = toml::from_str("").unwrap();
        assert_eq!(config, SchedulerConfig::default());
        assert_eq!(config.sweep_interval(), Duration::from_millis(7_500));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn parses_retry_table() {
        let config: SchedulerConfig = toml::from_str(
            r#"
            lease_ttl_ms = 1000
            sweep_interval_ms = 100

            [retry]
            max_attempts = 2
            base_delay_ms = 0
            multiplier = 1.0
            max_delay_ms = 0
            "#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.lease_ttl(), Duration::from_secs(1));
        assert_eq!(config.sweep_interval(), Duration::from_millis(100));
        assert_eq!(config.retry_policy(), RetryPolicy::immediate(2));
    }

    #[test]
    fn overrides_take_precedence() {
        let mut config = SchedulerConfig::default();
        config.apply_overrides(|key| match key {
            "CONDUCTOR_LEASE_TTL_MS" => Some("5000".into()),
            "CONDUCTOR_MAX_ATTEMPTS" => Some("7".into()),
            "CONDUCTOR_HEARTBEAT_TIMEOUT_MS" => Some("not a number".into()),
            _ => None,
        });

        assert_eq!(config.lease_ttl_ms, 5_000);
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.heartbeat_timeout_ms, 15_000);
    }

    #[test]
    fn rejects_invalid_values() {
        let mut config = SchedulerConfig::default();
        config.lease_ttl_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = SchedulerConfig::default();
        config.retry.multiplier = 0.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = SchedulerConfig::default();
        config.retry.max_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = SchedulerConfig::from_toml("lease_ttl_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
