//! Core job orchestration types and policies.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use partchain_core::{BatchId, Job, JobId, JobState, TransferProcessId};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    Fixed,
    /// base * 2^(attempt - 1), capped at `max_delay`
    #[default]
    Exponential,
    /// base * attempt, capped at `max_delay`
    Linear,
}

/// Retry policy for remote fetches.
///
/// `max_attempts` counts every attempt, the first one included. A step that
/// fails on every attempt therefore reports `max_attempts` as its retry count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) applied around the computed delay
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => (base_ms * 2_f64.powi((attempt - 1) as i32)).min(max_ms),
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic spread so tests can predict delays.
        let spread = delay_ms * self.jitter.clamp(0.0, 1.0);
        let offset = if spread > 0.0 {
            let unit = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            spread * (unit - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + offset).max(0.0) as u64)
    }

    /// Whether another attempt may follow `attempts_made` failed ones.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts.max(1)
    }
}

/// Immutable description of one unit of remote work.
pub trait DataRequest: fmt::Debug + Send + Sync + 'static {}

/// The outcome of executing one [`DataRequest`].
///
/// Carries the generated process id and the owning job, plus whatever the
/// handler needs to decide on follow-up requests.
pub trait TransferProcess: fmt::Debug + Send + Sync + 'static {
    fn id(&self) -> TransferProcessId;
    fn job_id(&self) -> JobId;
}

/// A job plus the bookkeeping the orchestrator needs to drive it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiTransferJob {
    pub job: Job,
    pub batch_id: Option<BatchId>,
    /// In-flight transfers. The job can finish only when this is empty.
    pub transfer_process_ids: BTreeSet<TransferProcessId>,
    /// In-flight transfers whose completion is currently being handled.
    pub claimed_process_ids: BTreeSet<TransferProcessId>,
    /// Transfers that finished, in completion order.
    pub completed_transfers: Vec<TransferProcessId>,
    /// Transfers that reported back after the job had already ended.
    /// Their results are not part of the job.
    #[serde(default)]
    pub released_transfers: Vec<TransferProcessId>,
    /// Set while the initial requests are being dispatched.
    pub seeding: bool,
    /// Handler context carried between expansion rounds.
    pub data: BTreeMap<String, serde_json::Value>,
}

impl MultiTransferJob {
    pub fn new(job: Job, batch_id: Option<BatchId>) -> Self {
        Self {
            job,
            batch_id,
            transfer_process_ids: BTreeSet::new(),
            claimed_process_ids: BTreeSet::new(),
            completed_transfers: Vec::new(),
            released_transfers: Vec::new(),
            seeding: true,
            data: BTreeMap::new(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn state(&self) -> JobState {
        self.job.state
    }

    /// No transfer in flight and no seeding in progress.
    pub fn is_drained(&self) -> bool {
        self.transfer_process_ids.is_empty() && !self.seeding
    }

    /// All transfer ids ever registered for this job.
    pub fn all_process_ids(&self) -> Vec<TransferProcessId> {
        self.completed_transfers
            .iter()
            .chain(self.released_transfers.iter())
            .chain(self.transfer_process_ids.iter())
            .copied()
            .collect()
    }
}

/// An update the handler asks the orchestrator to apply to the job's data bag.
#[derive(Debug, Clone, PartialEq)]
pub enum DataUpdate {
    Set { key: String, value: serde_json::Value },
    /// Add to an integer counter, treating a missing key as 0.
    Increment { key: String, by: i64 },
}

impl DataUpdate {
    pub fn set(key: impl Into<String>, value: serde_json::Value) -> Self {
        Self::Set {
            key: key.into(),
            value,
        }
    }

    pub fn increment(key: impl Into<String>, by: i64) -> Self {
        Self::Increment { key: key.into(), by }
    }

    pub fn apply(self, data: &mut BTreeMap<String, serde_json::Value>) {
        match self {
            DataUpdate::Set { key, value } => {
                data.insert(key, value);
            }
            DataUpdate::Increment { key, by } => {
                let current = data.get(&key).and_then(|v| v.as_i64()).unwrap_or(0);
                data.insert(key, serde_json::Value::from(current + by));
            }
        }
    }
}

/// Status of an initiation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Ok,
    /// The work was not dispatched (e.g. the registration hook refused it).
    NotAccepted,
    FatalError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferInitiateResponse {
    pub process_id: TransferProcessId,
    pub status: ResponseStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInitiateResponse {
    pub job_id: JobId,
    pub status: ResponseStatus,
    pub error: Option<String>,
}

impl JobInitiateResponse {
    pub fn ok(job_id: JobId) -> Self {
        Self {
            job_id,
            status: ResponseStatus::Ok,
            error: None,
        }
    }

    pub fn fatal(job_id: JobId, error: impl Into<String>) -> Self {
        Self {
            job_id,
            status: ResponseStatus::FatalError,
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}
