//! Batch orders: many root items, processed as numbered batches of jobs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use partchain_core::{
    Batch, BatchId, BatchOrder, BatchOrderId, BatchState, BomLifecycle, Direction, ItemKey, JobId,
    JobState,
};
use partchain_jobs::{
    BatchProgressTracker, BatchStore, BatchStoreError, JobConfig, JobStore, JobStoreError,
    TimeoutSchedulerBatchProcessingService,
};

use crate::service::{ItemGraphQueryService, QueryError, RegisterJob};

#[derive(Debug, thiserror::Error)]
pub enum BatchOrderError {
    #[error("invalid batch order: {0}")]
    Invalid(String),
    #[error("batch not found: {0}")]
    BatchNotFound(BatchId),
    #[error("batch order not found: {0}")]
    OrderNotFound(BatchOrderId),
    #[error(transparent)]
    Store(#[from] BatchStoreError),
    #[error(transparent)]
    Query(#[from] QueryError),
}

/// Root items plus the parameters shared by all of their jobs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegisterBatchOrder {
    pub keys: Vec<ItemKey>,
    pub depth: Option<u32>,
    pub aspects: Vec<String>,
    pub bom_lifecycle: BomLifecycle,
    pub direction: Direction,
    pub collect_aspects: bool,
    pub callback_url: Option<String>,
    /// Defaults to the configured batch size.
    pub batch_size: Option<usize>,
    /// Deadline of each batch; defaults to the configured batch timeout.
    pub timeout: Option<Duration>,
    /// Deadline of each job; defaults to the configured job timeout.
    pub job_timeout: Option<Duration>,
    pub owner: Option<String>,
}

impl RegisterBatchOrder {
    pub fn new(keys: Vec<ItemKey>) -> Self {
        Self {
            keys,
            ..Self::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn job_for(&self, key: ItemKey) -> RegisterJob {
        RegisterJob {
            key,
            depth: self.depth,
            aspects: self.aspects.clone(),
            bom_lifecycle: self.bom_lifecycle,
            direction: self.direction,
            collect_aspects: self.collect_aspects,
            callback_url: self.callback_url.clone(),
            owner: self.owner.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOrderResponse {
    pub batch_order_id: BatchOrderId,
    pub batch_ids: Vec<BatchId>,
}

/// A batch with the live state of each of its jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchView {
    pub batch: Batch,
    pub jobs: Vec<(JobId, Option<JobState>)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOrderView {
    pub order: BatchOrder,
    pub state: BatchState,
    pub batches: Vec<Batch>,
}

pub struct BatchOrderService {
    query: Arc<ItemGraphQueryService>,
    batch_store: Arc<dyn BatchStore>,
    job_store: Arc<dyn JobStore>,
    tracker: Arc<BatchProgressTracker>,
    scheduler: Arc<TimeoutSchedulerBatchProcessingService>,
    config: JobConfig,
}

impl BatchOrderService {
    pub fn new(
        query: Arc<ItemGraphQueryService>,
        batch_store: Arc<dyn BatchStore>,
        job_store: Arc<dyn JobStore>,
        tracker: Arc<BatchProgressTracker>,
        scheduler: Arc<TimeoutSchedulerBatchProcessingService>,
        config: JobConfig,
    ) -> Self {
        Self {
            query,
            batch_store,
            job_store,
            tracker,
            scheduler,
            config,
        }
    }

    /// Split the keys into batches, start every job and arm the timeouts.
    pub fn start_batch_order(
        &self,
        request: &RegisterBatchOrder,
    ) -> Result<BatchOrderResponse, BatchOrderError> {
        let mut parameters = None;
        for key in &request.keys {
            parameters = Some(request.job_for(key.clone()).parameters()?);
        }
        let parameters =
            parameters.ok_or_else(|| BatchOrderError::Invalid("no items given".to_string()))?;
        let batch_size = request.batch_size.unwrap_or(self.config.default_batch_size);
        if batch_size == 0 {
            return Err(BatchOrderError::Invalid("batch size must be positive".to_string()));
        }
        let timeout = request.timeout.unwrap_or(self.config.default_batch_timeout);
        let job_timeout = request.job_timeout.unwrap_or(self.config.default_job_timeout);

        let order = self.batch_store.save_order(BatchOrder {
            batch_order_id: BatchOrderId::new(),
            parameters,
            batch_size,
            timeout_secs: timeout.as_secs(),
            job_timeout_secs: job_timeout.as_secs(),
            owner: request.owner.clone(),
            created_on: Utc::now(),
        })?;
        let order_id = order.batch_order_id;

        let total = request.keys.len().div_ceil(batch_size) as u32;
        let batches = request
            .keys
            .chunks(batch_size)
            .enumerate()
            .map(|(index, keys)| {
                self.batch_store.save(Batch::new(
                    Some(order_id),
                    index as u32 + 1,
                    total,
                    keys.to_vec(),
                    request.owner.clone(),
                ))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut batch_ids = Vec::with_capacity(batches.len());
        for batch in batches {
            batch_ids.push(self.start_batch(request, batch, timeout, job_timeout)?);
        }

        info!(batch_order_id = %order_id, batches = batch_ids.len(), items = request.keys.len(), "batch order started");
        Ok(BatchOrderResponse {
            batch_order_id: order_id,
            batch_ids,
        })
    }

    fn start_batch(
        &self,
        request: &RegisterBatchOrder,
        mut batch: Batch,
        timeout: Duration,
        job_timeout: Duration,
    ) -> Result<BatchId, BatchOrderError> {
        let batch_id = batch.batch_id;
        for progress in &mut batch.job_progress {
            let response = self
                .query
                .register_job_in_batch(&request.job_for(progress.key.clone()), batch_id)?;
            if !response.is_ok() {
                warn!(batch_id = %batch_id, job_id = %response.job_id, error = ?response.error, "job of batch failed to start");
            }
            progress.job_id = Some(response.job_id);
        }
        batch.set_state(BatchState::Processing);
        let job_ids = batch.job_ids();
        self.batch_store.save(batch)?;

        self.scheduler.register_batch_timeout(batch_id, timeout);
        self.scheduler.register_jobs_timeout(job_ids, job_timeout);

        // Jobs that finished while the batch was starting were not tracked yet.
        self.tracker.refresh_batch(batch_id)?;
        Ok(batch_id)
    }

    pub fn get_batch(&self, batch_id: BatchId) -> Result<BatchView, BatchOrderError> {
        let batch = self
            .batch_store
            .find(batch_id)?
            .ok_or(BatchOrderError::BatchNotFound(batch_id))?;
        let jobs = batch
            .job_ids()
            .into_iter()
            .map(|job_id| {
                let state = self.job_store.find(job_id)?.map(|job| job.state());
                Ok((job_id, state))
            })
            .collect::<Result<Vec<_>, JobStoreError>>()
            .map_err(QueryError::from)?;
        Ok(BatchView { batch, jobs })
    }

    /// The order with its batches and the state combined across them.
    pub fn get_batch_order(&self, order_id: BatchOrderId) -> Result<BatchOrderView, BatchOrderError> {
        let order = self
            .batch_store
            .find_order(order_id)?
            .ok_or(BatchOrderError::OrderNotFound(order_id))?;
        let batches = self.batch_store.find_by_batch_order(order_id)?;
        let state = BatchState::combine(batches.iter().map(|b| b.batch_state));
        Ok(BatchOrderView {
            order,
            state,
            batches,
        })
    }
}
