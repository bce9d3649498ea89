//! Batch storage and progress tracking.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info, warn};

use partchain_core::{Batch, BatchId, BatchOrder, BatchOrderId, BatchState};

use crate::blob::{BlobPersistence, BlobPersistenceError};
use crate::events::{JobEventListener, JobProcessingFinished};
use crate::store::{JobStore, JobStoreError};

#[derive(Debug, Clone, thiserror::Error)]
pub enum BatchStoreError {
    #[error("batch not found: {0}")]
    NotFound(BatchId),
    #[error("batch order not found: {0}")]
    OrderNotFound(BatchOrderId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<JobStoreError> for BatchStoreError {
    fn from(err: JobStoreError) -> Self {
        BatchStoreError::Storage(err.to_string())
    }
}

impl From<BlobPersistenceError> for BatchStoreError {
    fn from(err: BlobPersistenceError) -> Self {
        BatchStoreError::Storage(err.to_string())
    }
}

/// Batch and batch order persistence.
pub trait BatchStore: Send + Sync {
    /// Insert or replace a batch.
    fn save(&self, batch: Batch) -> Result<Batch, BatchStoreError>;

    fn find(&self, batch_id: BatchId) -> Result<Option<Batch>, BatchStoreError>;

    fn find_all(&self) -> Result<Vec<Batch>, BatchStoreError>;

    /// Batches of an order, ordered by batch number.
    fn find_by_batch_order(&self, order_id: BatchOrderId) -> Result<Vec<Batch>, BatchStoreError>;

    fn save_order(&self, order: BatchOrder) -> Result<BatchOrder, BatchStoreError>;

    fn find_order(&self, order_id: BatchOrderId) -> Result<Option<BatchOrder>, BatchStoreError>;
}

fn poisoned() -> BatchStoreError {
    BatchStoreError::Storage("lock poisoned".to_string())
}

fn by_number(mut batches: Vec<Batch>) -> Vec<Batch> {
    batches.sort_by_key(|b| (b.batch_order_id, b.batch_number));
    batches
}

/// In-memory batch store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryBatchStore {
    batches: RwLock<HashMap<BatchId, Batch>>,
    orders: RwLock<HashMap<BatchOrderId, BatchOrder>>,
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl BatchStore for InMemoryBatchStore {
    fn save(&self, batch: Batch) -> Result<Batch, BatchStoreError> {
        let mut batches = self.batches.write().map_err(|_| poisoned())?;
        batches.insert(batch.batch_id, batch.clone());
        Ok(batch)
    }

    fn find(&self, batch_id: BatchId) -> Result<Option<Batch>, BatchStoreError> {
        let batches = self.batches.read().map_err(|_| poisoned())?;
        Ok(batches.get(&batch_id).cloned())
    }

    fn find_all(&self) -> Result<Vec<Batch>, BatchStoreError> {
        let batches = self.batches.read().map_err(|_| poisoned())?;
        Ok(by_number(batches.values().cloned().collect()))
    }

    fn find_by_batch_order(&self, order_id: BatchOrderId) -> Result<Vec<Batch>, BatchStoreError> {
        let batches = self.batches.read().map_err(|_| poisoned())?;
        Ok(by_number(
            batches
                .values()
                .filter(|b| b.batch_order_id == Some(order_id))
                .cloned()
                .collect(),
        ))
    }

    fn save_order(&self, order: BatchOrder) -> Result<BatchOrder, BatchStoreError> {
        let mut orders = self.orders.write().map_err(|_| poisoned())?;
        orders.insert(order.batch_order_id, order.clone());
        Ok(order)
    }

    fn find_order(&self, order_id: BatchOrderId) -> Result<Option<BatchOrder>, BatchStoreError> {
        let orders = self.orders.read().map_err(|_| poisoned())?;
        Ok(orders.get(&order_id).cloned())
    }
}

/// Batches as JSON blobs under `batch:<id>`, orders under `batch-order:<id>`.
pub struct BlobBatchStore {
    blobs: Arc<dyn BlobPersistence>,
}

impl BlobBatchStore {
    pub const BATCH_PREFIX: &'static str = "batch:";
    pub const ORDER_PREFIX: &'static str = "batch-order:";

    pub fn new(blobs: Arc<dyn BlobPersistence>) -> Self {
        Self { blobs }
    }

    fn put<T: serde::Serialize>(&self, key: String, value: &T) -> Result<(), BatchStoreError> {
        let bytes = serde_json::to_vec(value).map_err(|e| BatchStoreError::Storage(e.to_string()))?;
        self.blobs.put(&key, bytes)?;
        Ok(())
    }

    fn get<T: serde::de::DeserializeOwned>(&self, key: String) -> Result<Option<T>, BatchStoreError> {
        self.blobs
            .get(&key)?
            .map(|bytes| {
                serde_json::from_slice(&bytes).map_err(|e| BatchStoreError::Storage(e.to_string()))
            })
            .transpose()
    }
}

impl BatchStore for BlobBatchStore {
    fn save(&self, batch: Batch) -> Result<Batch, BatchStoreError> {
        self.put(format!("{}{}", Self::BATCH_PREFIX, batch.batch_id), &batch)?;
        Ok(batch)
    }

    fn find(&self, batch_id: BatchId) -> Result<Option<Batch>, BatchStoreError> {
        self.get(format!("{}{}", Self::BATCH_PREFIX, batch_id))
    }

    fn find_all(&self) -> Result<Vec<Batch>, BatchStoreError> {
        let batches = self
            .blobs
            .find_by_prefix(Self::BATCH_PREFIX)?
            .iter()
            .map(|(_, bytes)| {
                serde_json::from_slice(bytes).map_err(|e| BatchStoreError::Storage(e.to_string()))
            })
            .collect::<Result<Vec<Batch>, _>>()?;
        Ok(by_number(batches))
    }

    fn find_by_batch_order(&self, order_id: BatchOrderId) -> Result<Vec<Batch>, BatchStoreError> {
        Ok(self
            .find_all()?
            .into_iter()
            .filter(|b| b.batch_order_id == Some(order_id))
            .collect())
    }

    fn save_order(&self, order: BatchOrder) -> Result<BatchOrder, BatchStoreError> {
        self.put(format!("{}{}", Self::ORDER_PREFIX, order.batch_order_id), &order)?;
        Ok(order)
    }

    fn find_order(&self, order_id: BatchOrderId) -> Result<Option<BatchOrder>, BatchStoreError> {
        self.get(format!("{}{}", Self::ORDER_PREFIX, order_id))
    }
}

/// Keeps each batch's state in line with the states of its jobs.
///
/// Registered as a [`JobEventListener`]; every finished job of a batch
/// triggers a recomputation from the live job states.
pub struct BatchProgressTracker {
    batch_store: Arc<dyn BatchStore>,
    job_store: Arc<dyn JobStore>,
    // Serializes read-compute-save so a stale recomputation cannot overwrite a newer one.
    guard: Mutex<()>,
}

impl BatchProgressTracker {
    pub fn new(batch_store: Arc<dyn BatchStore>, job_store: Arc<dyn JobStore>) -> Self {
        Self {
            batch_store,
            job_store,
            guard: Mutex::new(()),
        }
    }

    /// Recompute and persist the state of one batch.
    pub fn refresh_batch(&self, batch_id: BatchId) -> Result<Option<Batch>, BatchStoreError> {
        let _guard = self.guard.lock().map_err(|_| poisoned())?;

        let mut batch = match self.batch_store.find(batch_id)? {
            Some(batch) => batch,
            None => return Ok(None),
        };
        // INITIALIZED batches are still being started; their job list is incomplete.
        if batch.batch_state == BatchState::Initialized || batch.batch_state.is_terminal() {
            return Ok(Some(batch));
        }

        // A failed lookup aborts the refresh; it must not count as a missing job.
        let states = batch
            .job_progress
            .iter()
            .map(|progress| match progress.job_id {
                Some(id) => Ok(self.job_store.find(id)?.map(|job| job.state())),
                None => Ok(None),
            })
            .collect::<Result<Vec<_>, JobStoreError>>()?;
        let next = BatchState::from_job_states(states);
        if next == BatchState::Initialized || next == batch.batch_state {
            return Ok(Some(batch));
        }

        batch.set_state(next);
        info!(batch_id = %batch_id, state = ?next, "batch state changed");
        self.batch_store.save(batch).map(Some)
    }
}

impl JobEventListener for BatchProgressTracker {
    fn on_job_processing_finished(&self, event: &JobProcessingFinished) {
        let Some(batch_id) = event.batch_id else {
            return;
        };
        debug!(batch_id = %batch_id, job_id = %event.job_id, state = ?event.state, "job of batch finished");
        if let Err(e) = self.refresh_batch(batch_id) {
            warn!(batch_id = %batch_id, error = %e, "failed to update batch progress");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::store::{BlobJobBackend, BlobJobStore, InMemoryJobStore};
    use crate::types::MultiTransferJob;
    use partchain_core::{ItemKey, Job, JobId, JobParameters, JobProgress, JobState};

    fn stored_job(store: &InMemoryJobStore, batch_id: BatchId, finish: Option<JobState>) -> JobId {
        let job = Job::new(ItemKey::new("urn:uuid:a", "BPNL1"), JobParameters::default(), None);
        let job = store.create(MultiTransferJob::new(job, Some(batch_id))).unwrap();
        let job_id = job.job_id();
        store.transition_running(job_id).unwrap();
        match finish {
            Some(JobState::Completed) => {
                store.finish_seeding(job_id).unwrap();
                store.complete_job(job_id).unwrap();
            }
            Some(JobState::Cancelled) => {
                store.cancel_job(job_id).unwrap();
            }
            _ => {}
        }
        job_id
    }

    fn batch_with(jobs: &[JobId]) -> Batch {
        let mut batch = Batch::new(None, 1, 1, vec![], None);
        batch.job_progress = jobs
            .iter()
            .map(|id| JobProgress {
                key: ItemKey::new("urn:uuid:a", "BPNL1"),
                job_id: Some(*id),
            })
            .collect();
        batch.set_state(BatchState::Processing);
        batch
    }

    #[test]
    fn batch_stays_processing_until_every_job_finished() {
        let jobs = InMemoryJobStore::arc();
        let batches = InMemoryBatchStore::arc();
        let tracker = BatchProgressTracker::new(batches.clone(), jobs.clone());

        let id = BatchId::new();
        let done = stored_job(&jobs, id, Some(JobState::Completed));
        let running = stored_job(&jobs, id, None);
        batches.save(batch_with(&[done, running]).with_id(id)).unwrap();

        let refreshed = tracker.refresh_batch(id).unwrap().unwrap();
        assert_eq!(refreshed.batch_state, BatchState::Processing);
    }

    #[test]
    fn mixed_outcomes_end_partial() {
        let jobs = InMemoryJobStore::arc();
        let batches = InMemoryBatchStore::arc();
        let tracker = BatchProgressTracker::new(batches.clone(), jobs.clone());

        let id = BatchId::new();
        let done = stored_job(&jobs, id, Some(JobState::Completed));
        let cancelled = stored_job(&jobs, id, Some(JobState::Cancelled));
        batches.save(batch_with(&[done, cancelled]).with_id(id)).unwrap();

        tracker.on_job_processing_finished(&JobProcessingFinished {
            job_id: cancelled,
            state: JobState::Cancelled,
            callback_url: None,
            batch_id: Some(id),
        });

        let batch = batches.find(id).unwrap().unwrap();
        assert_eq!(batch.batch_state, BatchState::Partial);
        assert!(batch.completed_on.is_some());
    }

    #[test]
    fn batch_that_is_still_starting_is_left_alone() {
        let jobs = InMemoryJobStore::arc();
        let batches = InMemoryBatchStore::arc();
        let tracker = BatchProgressTracker::new(batches.clone(), jobs.clone());

        let id = BatchId::new();
        let done = stored_job(&jobs, id, Some(JobState::Completed));
        let mut batch = batch_with(&[done]).with_id(id);
        batch.batch_state = BatchState::Initialized;
        batches.save(batch).unwrap();

        let refreshed = tracker.refresh_batch(id).unwrap().unwrap();
        assert_eq!(refreshed.batch_state, BatchState::Initialized);
    }

    #[test]
    fn unreadable_job_keeps_the_batch_processing() {
        let blobs = InMemoryBlobStore::arc();
        let jobs = Arc::new(BlobJobStore::from_blobs(blobs.clone()));
        let batches = InMemoryBatchStore::arc();
        let tracker = BatchProgressTracker::new(batches.clone(), jobs.clone());

        let id = BatchId::new();
        let done = JobId::new();
        let job = Job::new(ItemKey::new("urn:uuid:a", "BPNL1"), JobParameters::default(), None);
        let broken = jobs.create(MultiTransferJob::new(job, Some(id))).unwrap().job_id();
        batches.save(batch_with(&[done, broken]).with_id(id)).unwrap();
        blobs
            .put(&format!("{}{}", BlobJobBackend::KEY_PREFIX, broken), b"not json".to_vec())
            .unwrap();

        assert!(matches!(
            tracker.refresh_batch(id),
            Err(BatchStoreError::Storage(_))
        ));
        let batch = batches.find(id).unwrap().unwrap();
        assert_eq!(batch.batch_state, BatchState::Processing);
        assert!(batch.completed_on.is_none());
    }

    #[test]
    fn blob_store_orders_batches_by_number() {
        let store = BlobBatchStore::new(InMemoryBlobStore::arc());
        let order_id = BatchOrderId::new();
        for number in [2, 1, 3] {
            store
                .save(Batch::new(Some(order_id), number, 3, vec![], None))
                .unwrap();
        }
        store.save(Batch::new(None, 1, 1, vec![], None)).unwrap();

        let numbers: Vec<_> = store
            .find_by_batch_order(order_id)
            .unwrap()
            .iter()
            .map(|b| b.batch_number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(store.find_all().unwrap().len(), 4);
    }

    trait WithId {
        fn with_id(self, id: BatchId) -> Self;
    }

    impl WithId for Batch {
        fn with_id(mut self, id: BatchId) -> Self {
            self.batch_id = id;
            self
        }
    }
}
