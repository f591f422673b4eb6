//! Runner configuration.

use std::time::Duration;
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Prefix for environment overrides read by [`TaskRunnerConfig::from_env`].
pub const ENV_PREFIX: &str = "SCRY_TASK_";

/// Configuration-related errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Settings for a [`TaskRunner`](crate::TaskRunner). Fixed once the runner starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRunnerConfig {
    /// Capacity of the in-memory queue; `submit` waits once it is full.
    pub queue_size: usize,
    /// Number of concurrent workers.
    pub worker_count: usize,
    /// How long a task may sit in `Processing` before it is presumed abandoned.
    pub stuck_task_age: Duration,
    /// How often the sweeper runs. Half of `stuck_task_age` when unset.
    pub sweep_interval: Option<Duration>,
    /// Reset every `Processing` row and requeue every `Pending` row on start.
    pub recover_on_start: bool,
    /// Backoff for store writes made by workers and the sweeper.
    pub store_retry: RetryPolicy,
}

impl Default for TaskRunnerConfig {
    fn default() -> Self {
        Self {
            queue_size: 100,
            worker_count: 2,
            stuck_task_age: Duration::from_secs(30 * 60),
            sweep_interval: None,
            recover_on_start: true,
            store_retry: RetryPolicy::default(),
        }
    }
}

impl TaskRunnerConfig {
    /// Defaults overridden by `SCRY_TASK_*` environment variables.
    ///
    /// | variable                          | field              |
    /// |-----------------------------------|--------------------|
    /// | `SCRY_TASK_WORKER_COUNT`          | `worker_count`     |
    /// | `SCRY_TASK_QUEUE_SIZE`            | `queue_size`       |
    /// | `SCRY_TASK_STUCK_TASK_AGE_MINUTES`| `stuck_task_age`   |
    /// | `SCRY_TASK_SWEEP_INTERVAL_SECS`   | `sweep_interval`   |
    /// | `SCRY_TASK_RECOVER_ON_START`      | `recover_on_start` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) but reads values through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some((key, value)) = get("WORKER_COUNT") {
            config.worker_count = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("QUEUE_SIZE") {
            config.queue_size = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("STUCK_TASK_AGE_MINUTES") {
            config.stuck_task_age = Duration::from_secs(parse::<u64>(&key, &value)? * 60);
        }
        if let Some((key, value)) = get("SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Some(Duration::from_secs(parse(&key, &value)?));
        }
        if let Some((key, value)) = get("RECOVER_ON_START") {
            config.recover_on_start = parse(&key, &value)?;
        }
        Ok(config)
    }

    /// The sweep period actually used.
    pub fn effective_sweep_interval(&self) -> Duration {
        self.sweep_interval.unwrap_or(self.stuck_task_age / 2)
    }

    /// Reject settings the runner cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count < 1 {
            return Err(invalid("worker_count", "must be at least 1"));
        }
        if self.queue_size < 1 {
            return Err(invalid("queue_size", "must be at least 1"));
        }
        if self.stuck_task_age.is_zero() {
            return Err(invalid("stuck_task_age", "must be greater than zero"));
        }
        if self.effective_sweep_interval().is_zero() {
            return Err(invalid("sweep_interval", "must be greater than zero"));
        }
        Ok(())
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{value:?}: {e}"),
    })
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_production_settings() {
        let config = TaskRunnerConfig::default();
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.queue_size, 100);
        assert_eq!(config.stuck_task_age, Duration::from_secs(1800));
        assert_eq!(config.effective_sweep_interval(), Duration::from_secs(900));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = TaskRunnerConfig::from_lookup(lookup(&[
            ("SCRY_TASK_WORKER_COUNT", "8"),
            ("SCRY_TASK_QUEUE_SIZE", " 16 "),
            ("SCRY_TASK_STUCK_TASK_AGE_MINUTES", "10"),
            ("SCRY_TASK_SWEEP_INTERVAL_SECS", "30"),
            ("SCRY_TASK_RECOVER_ON_START", "false"),
        ]))
        .unwrap();

        assert_eq!(config.worker_count, 8);
        assert_eq!(config.queue_size, 16);
        assert_eq!(config.stuck_task_age, Duration::from_secs(600));
        assert_eq!(config.effective_sweep_interval(), Duration::from_secs(30));
        assert!(!config.recover_on_start);
    }

    #[test]
    fn unparsable_value_names_the_variable() {
        let err = TaskRunnerConfig::from_lookup(lookup(&[("SCRY_TASK_WORKER_COUNT", "many")]))
            .unwrap_err();
        let ConfigError::InvalidValue { key, .. } = err;
        assert_eq!(key, "SCRY_TASK_WORKER_COUNT");
    }

    #[test]
    fn validate_rejects_empty_pool_and_zero_durations() {
        let no_workers = TaskRunnerConfig {
            worker_count: 0,
            ..Default::default()
        };
        assert!(no_workers.validate().is_err());

        let no_queue = TaskRunnerConfig {
            queue_size: 0,
            ..Default::default()
        };
        assert!(no_queue.validate().is_err());

        let no_age = TaskRunnerConfig {
            stuck_task_age: Duration::ZERO,
            ..Default::default()
        };
        assert!(no_age.validate().is_err());

        let no_sweep = TaskRunnerConfig {
            sweep_interval: Some(Duration::ZERO),
            ..Default::default()
        };
        assert!(no_sweep.validate().is_err());
    }
}
