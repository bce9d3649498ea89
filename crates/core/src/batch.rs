//! Batches: fixed-size slices of a batch order, each tracking a set of jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{BatchId, BatchOrderId, JobId};
use crate::job::{ItemKey, JobParameters, JobState};

/// Aggregate state of a batch or batch order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchState {
    Initialized,
    Processing,
    Completed,
    Partial,
    Error,
}

impl BatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchState::Completed | BatchState::Partial | BatchState::Error)
    }

    /// Derive the batch state from the states of its jobs.
    ///
    /// Any job still in flight keeps the batch `PROCESSING`. Otherwise all
    /// completed means `COMPLETED`, none completed means `ERROR`, and a mix
    /// means `PARTIAL`. A missing job (`None`) counts as failed.
    pub fn from_job_states<I>(states: I) -> BatchState
    where
        I: IntoIterator<Item = Option<JobState>>,
    {
        let mut total = 0usize;
        let mut completed = 0usize;
        for state in states {
            total += 1;
            match state {
                Some(s) if !s.is_terminal() => return BatchState::Processing,
                Some(JobState::Completed) => completed += 1,
                _ => {}
            }
        }

        if total == 0 {
            BatchState::Initialized
        } else if completed == total {
            BatchState::Completed
        } else if completed == 0 {
            BatchState::Error
        } else {
            BatchState::Partial
        }
    }

    /// Combine batch states into a batch order state, using the same rules.
    pub fn combine<I>(states: I) -> BatchState
    where
        I: IntoIterator<Item = BatchState>,
    {
        let mut total = 0usize;
        let mut completed = 0usize;
        let mut failed = 0usize;
        for state in states {
            total += 1;
            match state {
                BatchState::Initialized | BatchState::Processing => return BatchState::Processing,
                BatchState::Completed => completed += 1,
                BatchState::Error => failed += 1,
                BatchState::Partial => {}
            }
        }

        if total == 0 {
            BatchState::Initialized
        } else if completed == total {
            BatchState::Completed
        } else if failed == total {
            BatchState::Error
        } else {
            BatchState::Partial
        }
    }
}

/// One root item in a batch and, once started, the job discovering it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub key: ItemKey,
    pub job_id: Option<JobId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: BatchId,
    pub batch_order_id: Option<BatchOrderId>,
    /// 1-based position within the order.
    pub batch_number: u32,
    pub batch_total: u32,
    pub batch_state: BatchState,
    pub job_progress: Vec<JobProgress>,
    pub owner: Option<String>,
    pub started_on: Option<DateTime<Utc>>,
    pub completed_on: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn new(
        batch_order_id: Option<BatchOrderId>,
        batch_number: u32,
        batch_total: u32,
        keys: Vec<ItemKey>,
        owner: Option<String>,
    ) -> Self {
        Self {
            batch_id: BatchId::new(),
            batch_order_id,
            batch_number,
            batch_total,
            batch_state: BatchState::Initialized,
            job_progress: keys
                .into_iter()
                .map(|key| JobProgress { key, job_id: None })
                .collect(),
            owner,
            started_on: None,
            completed_on: None,
        }
    }

    /// Ids of the jobs started for this batch.
    pub fn job_ids(&self) -> Vec<JobId> {
        self.job_progress.iter().filter_map(|p| p.job_id).collect()
    }

    /// Record a new state; stamps `completed_on` on the first terminal state.
    pub fn set_state(&mut self, state: BatchState) {
        self.batch_state = state;
        if state == BatchState::Processing && self.started_on.is_none() {
            self.started_on = Some(Utc::now());
        }
        if state.is_terminal() && self.completed_on.is_none() {
            self.completed_on = Some(Utc::now());
        }
    }
}

/// A submission of many root items, processed as numbered batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOrder {
    pub batch_order_id: BatchOrderId,
    pub parameters: JobParameters,
    pub batch_size: usize,
    pub timeout_secs: u64,
    pub job_timeout_secs: u64,
    pub owner: Option<String>,
    pub created_on: DateTime<Utc>,
}
