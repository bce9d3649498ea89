//! Timeout-driven cancellation of jobs, batches and batch orders.
//!
//! The scheduler only arms timers. When a timer fires, the cancellation
//! service re-reads live state and cancels whatever is still unfinished.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use partchain_core::{BatchId, BatchOrderId, BatchState, JobId, JobState};

use crate::batch::BatchStore;

/// The slice of job management that cancellation needs.
pub trait JobControl: Send + Sync {
    fn job_state(&self, job_id: JobId) -> Option<JobState>;

    /// Cancel the job if it is still `UNSAVED`, `INITIAL` or `RUNNING`,
    /// checked atomically with the transition. Returns whether it was
    /// cancelled.
    fn cancel(&self, job_id: JobId) -> bool;
}

/// Cancels jobs that are still unfinished.
pub struct CancelBatchProcessingService {
    job_control: Arc<dyn JobControl>,
    batch_store: Arc<dyn BatchStore>,
}

impl CancelBatchProcessingService {
    pub fn new(job_control: Arc<dyn JobControl>, batch_store: Arc<dyn BatchStore>) -> Self {
        Self {
            job_control,
            batch_store,
        }
    }

    /// Cancel those of `job_ids` that are still `UNSAVED`, `INITIAL` or
    /// `RUNNING`. Returns the ids that were cancelled.
    pub fn cancel_not_finished_jobs(&self, job_ids: &[JobId]) -> Vec<JobId> {
        job_ids
            .iter()
            .copied()
            .filter(|id| match self.job_control.job_state(*id) {
                Some(state) if state.is_cancellable() => self.job_control.cancel(*id),
                Some(state) => {
                    debug!(job_id = %id, state = ?state, "job already finished, skipping");
                    false
                }
                None => {
                    debug!(job_id = %id, "job not found, skipping");
                    false
                }
            })
            .collect()
    }

    /// Cancel the unfinished jobs of a batch that is still in progress.
    pub fn cancel_not_finished_jobs_in_batch(&self, batch_id: BatchId) -> Vec<JobId> {
        let batch = match self.batch_store.find(batch_id) {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                warn!(batch_id = %batch_id, "batch not found, nothing to cancel");
                return Vec::new();
            }
            Err(e) => {
                warn!(batch_id = %batch_id, error = %e, "failed to load batch");
                return Vec::new();
            }
        };

        if !matches!(batch.batch_state, BatchState::Initialized | BatchState::Processing) {
            debug!(batch_id = %batch_id, state = ?batch.batch_state, "batch already finished");
            return Vec::new();
        }

        let cancelled = self.cancel_not_finished_jobs(&batch.job_ids());
        info!(batch_id = %batch_id, cancelled = cancelled.len(), "batch timed out");
        cancelled
    }

    /// Cancel the unfinished jobs of every batch of an order.
    pub fn cancel_not_finished_jobs_in_batch_order(&self, order_id: BatchOrderId) -> Vec<JobId> {
        match self.batch_store.find_by_batch_order(order_id) {
            Ok(batches) => batches
                .iter()
                .flat_map(|batch| self.cancel_not_finished_jobs_in_batch(batch.batch_id))
                .collect(),
            Err(e) => {
                warn!(batch_order_id = %order_id, error = %e, "failed to load batches of order");
                Vec::new()
            }
        }
    }
}

/// Arms one-shot timers that hand over to [`CancelBatchProcessingService`].
pub struct TimeoutSchedulerBatchProcessingService {
    cancel_service: Arc<CancelBatchProcessingService>,
    runtime: Handle,
}

impl TimeoutSchedulerBatchProcessingService {
    pub fn new(cancel_service: Arc<CancelBatchProcessingService>, runtime: Handle) -> Self {
        Self {
            cancel_service,
            runtime,
        }
    }

    pub fn register_jobs_timeout(
        &self,
        job_ids: Vec<JobId>,
        timeout: Duration,
    ) -> JoinHandle<Vec<JobId>> {
        let service = Arc::clone(&self.cancel_service);
        debug!(jobs = job_ids.len(), timeout_secs = timeout.as_secs(), "job timeout registered");
        self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            service.cancel_not_finished_jobs(&job_ids)
        })
    }

    pub fn register_batch_timeout(
        &self,
        batch_id: BatchId,
        timeout: Duration,
    ) -> JoinHandle<Vec<JobId>> {
        let service = Arc::clone(&self.cancel_service);
        debug!(batch_id = %batch_id, timeout_secs = timeout.as_secs(), "batch timeout registered");
        self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            service.cancel_not_finished_jobs_in_batch(batch_id)
        })
    }

    pub fn register_batch_order_timeout(
        &self,
        order_id: BatchOrderId,
        timeout: Duration,
    ) -> JoinHandle<Vec<JobId>> {
        let service = Arc::clone(&self.cancel_service);
        debug!(batch_order_id = %order_id, timeout_secs = timeout.as_secs(), "batch order timeout registered");
        self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            service.cancel_not_finished_jobs_in_batch_order(order_id)
        })
    }
}
