//! Engine configuration, read from `PARTCHAIN_*` environment variables.

use std::time::Duration;

use crate::types::RetryPolicy;

pub const WORKER_POOL_SIZE: &str = "PARTCHAIN_WORKER_POOL_SIZE";
pub const RETRY_MAX_ATTEMPTS: &str = "PARTCHAIN_RETRY_MAX_ATTEMPTS";
pub const RETRY_BASE_DELAY_MS: &str = "PARTCHAIN_RETRY_BASE_DELAY_MS";
pub const RETRY_MAX_DELAY_MS: &str = "PARTCHAIN_RETRY_MAX_DELAY_MS";
pub const TTL_COMPLETED_JOBS_SECS: &str = "PARTCHAIN_TTL_COMPLETED_JOBS_SECS";
pub const TTL_FAILED_JOBS_SECS: &str = "PARTCHAIN_TTL_FAILED_JOBS_SECS";
pub const CLEANUP_INTERVAL_SECS: &str = "PARTCHAIN_CLEANUP_INTERVAL_SECS";
pub const DEFAULT_BATCH_SIZE: &str = "PARTCHAIN_DEFAULT_BATCH_SIZE";
pub const DEFAULT_JOB_TIMEOUT_SECS: &str = "PARTCHAIN_DEFAULT_JOB_TIMEOUT_SECS";
pub const DEFAULT_BATCH_TIMEOUT_SECS: &str = "PARTCHAIN_DEFAULT_BATCH_TIMEOUT_SECS";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Runtime configuration of the job engine.
#[derive(Debug, Clone, PartialEq)]
pub struct JobConfig {
    /// Maximum number of transfers executing at once
    pub worker_pool_size: usize,
    pub retry_policy: RetryPolicy,
    /// How long completed jobs and their blobs are kept
    pub completed_job_ttl: Duration,
    /// How long failed jobs and their blobs are kept
    pub failed_job_ttl: Duration,
    pub cleanup_interval: Duration,
    pub default_batch_size: usize,
    pub default_job_timeout: Duration,
    pub default_batch_timeout: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 8,
            retry_policy: RetryPolicy::default(),
            completed_job_ttl: Duration::from_secs(3600),
            failed_job_ttl: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(300),
            default_batch_size: 10,
            default_job_timeout: Duration::from_secs(3600),
            default_batch_timeout: Duration::from_secs(43_200),
        }
    }
}

impl JobConfig {
    /// Defaults overridden by any `PARTCHAIN_*` variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading values through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let read = |key: &'static str, default: u64| -> Result<u64, ConfigError> {
            match lookup(key) {
                None => Ok(default),
                Some(raw) => raw.trim().parse::<u64>().map_err(|_| ConfigError::Invalid {
                    key,
                    value: raw.clone(),
                }),
            }
        };
        let positive = |key: &'static str, default: u64| -> Result<u64, ConfigError> {
            let value = read(key, default)?;
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    value: value.to_string(),
                });
            }
            Ok(value)
        };

        let retry_policy = RetryPolicy {
            max_attempts: positive(RETRY_MAX_ATTEMPTS, defaults.retry_policy.max_attempts as u64)? as u32,
            base_delay: Duration::from_millis(read(
                RETRY_BASE_DELAY_MS,
                defaults.retry_policy.base_delay.as_millis() as u64,
            )?),
            max_delay: Duration::from_millis(read(
                RETRY_MAX_DELAY_MS,
                defaults.retry_policy.max_delay.as_millis() as u64,
            )?),
            ..defaults.retry_policy.clone()
        };

        Ok(Self {
            worker_pool_size: positive(WORKER_POOL_SIZE, defaults.worker_pool_size as u64)? as usize,
            retry_policy,
            completed_job_ttl: Duration::from_secs(read(
                TTL_COMPLETED_JOBS_SECS,
                defaults.completed_job_ttl.as_secs(),
            )?),
            failed_job_ttl: Duration::from_secs(read(
                TTL_FAILED_JOBS_SECS,
                defaults.failed_job_ttl.as_secs(),
            )?),
            cleanup_interval: Duration::from_secs(positive(
                CLEANUP_INTERVAL_SECS,
                defaults.cleanup_interval.as_secs(),
            )?),
            default_batch_size: positive(DEFAULT_BATCH_SIZE, defaults.default_batch_size as u64)?
                as usize,
            default_job_timeout: Duration::from_secs(positive(
                DEFAULT_JOB_TIMEOUT_SECS,
                defaults.default_job_timeout.as_secs(),
            )?),
            default_batch_timeout: Duration::from_secs(positive(
                DEFAULT_BATCH_TIMEOUT_SECS,
                defaults.default_batch_timeout.as_secs(),
            )?),
        })
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_default_batch_size(mut self, size: usize) -> Self {
        self.default_batch_size = size;
        self
    }
}
