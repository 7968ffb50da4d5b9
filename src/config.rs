//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::error::ConfigError;

/// Retry policy for spam classification calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first call.
    pub max_attempts: u32,
    /// Delay after the first retryable failure; doubles on each further one.
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Capacity of every inter-stage channel.
    pub channel_capacity: usize,
    /// Users per mailbox batch call.
    pub batch_size: usize,
    /// Maximum in-flight spam checks across the whole pipeline.
    pub spam_max_concurrency: usize,
    /// Maximum in-flight user resolutions (`None` = unbounded).
    pub resolve_concurrency: Option<usize>,
    /// Maximum in-flight batch dispatches (`None` = unbounded).
    pub fetch_concurrency: Option<usize>,
    /// Retry policy for spam checks.
    pub retry: RetryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1,
            batch_size: 2,
            spam_max_concurrency: 5,
            resolve_concurrency: None,
            fetch_concurrency: None,
            retry: RetryConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Defaults overlaid with `SPAMMER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var::<usize, _>(&lookup, "SPAMMER_CHANNEL_CAPACITY")? {
            config.channel_capacity = v;
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, "SPAMMER_BATCH_SIZE")? {
            config.batch_size = v;
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, "SPAMMER_SPAM_CONCURRENCY")? {
            config.spam_max_concurrency = v;
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, "SPAMMER_RESOLVE_CONCURRENCY")? {
            config.resolve_concurrency = (v > 0).then_some(v);
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, "SPAMMER_FETCH_CONCURRENCY")? {
            config.fetch_concurrency = (v > 0).then_some(v);
        }
        if let Some(v) = parse_var::<u32, _>(&lookup, "SPAMMER_RETRY_ATTEMPTS")? {
            config.retry.max_attempts = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "SPAMMER_RETRY_BASE_MS")? {
            config.retry.base_delay = Duration::from_millis(v);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("channel_capacity", self.channel_capacity),
            ("batch_size", self.batch_size),
            ("spam_max_concurrency", self.spam_max_concurrency),
            ("retry.max_attempts", self.retry.max_attempts as usize),
        ];
        for (key, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }

        // Channels and gates are semaphore-backed and cannot hold more permits.
        let permit_backed = [
            ("channel_capacity", Some(self.channel_capacity)),
            ("spam_max_concurrency", Some(self.spam_max_concurrency)),
            ("resolve_concurrency", self.resolve_concurrency),
            ("fetch_concurrency", self.fetch_concurrency),
        ];
        for (key, value) in permit_backed {
            if value.is_some_and(|v| v > Semaphore::MAX_PERMITS) {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("must not exceed {}", Semaphore::MAX_PERMITS),
                });
            }
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
    }
}
