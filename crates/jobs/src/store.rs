//! Job storage implementations.
//!
//! Every mutating operation is a read-modify-write under the store's write
//! lock, so concurrent transfer completions of one job serialize here. The
//! storage medium is a [`JobBackend`]: a plain map for tests, or
//! [`BlobPersistence`] for the persistent variant.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use partchain_core::{JobId, JobState, ProcessingError, TransferProcessId};

use crate::blob::{BlobPersistence, BlobPersistenceError};
use crate::types::{DataUpdate, MultiTransferJob};

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {job_id} cannot move from {from:?} to {to:?}")]
    InvalidState {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<BlobPersistenceError> for JobStoreError {
    fn from(err: BlobPersistenceError) -> Self {
        JobStoreError::Storage(err.to_string())
    }
}

/// Result of an operation that may or may not have changed the job.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub job: MultiTransferJob,
    pub changed: bool,
}

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    /// Persist a new job, moving it from `UNSAVED` to `INITIAL`.
    fn create(&self, job: MultiTransferJob) -> Result<MultiTransferJob, JobStoreError>;

    fn find(&self, job_id: JobId) -> Result<Option<MultiTransferJob>, JobStoreError>;

    fn find_all(&self) -> Result<Vec<MultiTransferJob>, JobStoreError>;

    fn find_by_states(&self, states: &[JobState]) -> Result<Vec<MultiTransferJob>, JobStoreError>;

    /// The job whose in-flight set contains `process_id`.
    fn find_by_process_id(
        &self,
        process_id: TransferProcessId,
    ) -> Result<Option<MultiTransferJob>, JobStoreError>;

    /// Jobs in `state` whose completion timestamp is before `cutoff`.
    fn find_by_state_and_completion_older_than(
        &self,
        state: JobState,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<MultiTransferJob>, JobStoreError>;

    /// `INITIAL -> RUNNING`.
    fn transition_running(&self, job_id: JobId) -> Result<MultiTransferJob, JobStoreError>;

    /// Add a transfer to the in-flight set. Ignored once the job is terminal.
    fn add_transfer_process(
        &self,
        job_id: JobId,
        process_id: TransferProcessId,
    ) -> Result<bool, JobStoreError>;

    /// Claim an in-flight transfer for completion handling.
    ///
    /// Returns a snapshot of the job only for the first claim of a transfer
    /// that is still in flight on a `RUNNING` job. Duplicate or stale
    /// completions get `None`.
    fn claim_transfer_process(
        &self,
        job_id: JobId,
        process_id: TransferProcessId,
    ) -> Result<Option<MultiTransferJob>, JobStoreError>;

    /// Remove a transfer from the in-flight set and record it as completed.
    ///
    /// Returns `true` when this removal drained the job and moved it to
    /// `TRANSFERS_FINISHED`. At most one caller per job ever sees `true`.
    fn complete_transfer_process(
        &self,
        job_id: JobId,
        process_id: TransferProcessId,
    ) -> Result<bool, JobStoreError>;

    /// Clear the seeding flag; same return contract as
    /// [`complete_transfer_process`](JobStore::complete_transfer_process).
    fn finish_seeding(&self, job_id: JobId) -> Result<bool, JobStoreError>;

    /// `TRANSFERS_FINISHED -> COMPLETED`. Returns `false` if the job has
    /// meanwhile left `TRANSFERS_FINISHED` (e.g. it was cancelled).
    fn complete_job(&self, job_id: JobId) -> Result<bool, JobStoreError>;

    /// Move to `ERROR` if still allowed; returns whether it did.
    fn mark_job_in_error(&self, job_id: JobId, error: ProcessingError)
    -> Result<bool, JobStoreError>;

    /// Move to `CANCELLED` if not yet terminal. Idempotent.
    fn cancel_job(&self, job_id: JobId) -> Result<Option<StateChange>, JobStoreError> {
        self.cancel_job_if(job_id, &|state| !state.is_terminal())
    }

    /// Move to `CANCELLED` only if the current state passes `allowed`.
    /// The state is checked under the same lock as the transition.
    fn cancel_job_if(
        &self,
        job_id: JobId,
        allowed: &dyn Fn(JobState) -> bool,
    ) -> Result<Option<StateChange>, JobStoreError>;

    /// Drop a transfer that reported back after its job had already ended.
    /// Returns `false` while the job is still live.
    fn release_transfer_process(
        &self,
        job_id: JobId,
        process_id: TransferProcessId,
    ) -> Result<bool, JobStoreError>;

    fn delete_job(&self, job_id: JobId) -> Result<Option<MultiTransferJob>, JobStoreError>;

    /// Apply handler data updates atomically.
    fn update_data(&self, job_id: JobId, updates: Vec<DataUpdate>) -> Result<(), JobStoreError>;
}

/// Storage medium behind a [`LockingJobStore`].
pub trait JobBackend: Send + Sync {
    fn load(&self, job_id: JobId) -> Result<Option<MultiTransferJob>, JobStoreError>;
    fn save(&mut self, job: &MultiTransferJob) -> Result<(), JobStoreError>;
    fn remove(&mut self, job_id: JobId) -> Result<Option<MultiTransferJob>, JobStoreError>;
    fn all(&self) -> Result<Vec<MultiTransferJob>, JobStoreError>;
}

/// Map-backed storage for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobBackend {
    jobs: HashMap<JobId, MultiTransferJob>,
}

impl JobBackend for InMemoryJobBackend {
    fn load(&self, job_id: JobId) -> Result<Option<MultiTransferJob>, JobStoreError> {
        Ok(self.jobs.get(&job_id).cloned())
    }

    fn save(&mut self, job: &MultiTransferJob) -> Result<(), JobStoreError> {
        self.jobs.insert(job.job_id(), job.clone());
        Ok(())
    }

    fn remove(&mut self, job_id: JobId) -> Result<Option<MultiTransferJob>, JobStoreError> {
        Ok(self.jobs.remove(&job_id))
    }

    fn all(&self) -> Result<Vec<MultiTransferJob>, JobStoreError> {
        Ok(self.jobs.values().cloned().collect())
    }
}

/// Serializes jobs as JSON blobs under `job:<id>`.
pub struct BlobJobBackend {
    blobs: Arc<dyn BlobPersistence>,
}

impl BlobJobBackend {
    pub const KEY_PREFIX: &'static str = "job:";

    pub fn new(blobs: Arc<dyn BlobPersistence>) -> Self {
        Self { blobs }
    }

    fn key(job_id: JobId) -> String {
        format!("{}{}", Self::KEY_PREFIX, job_id)
    }

    fn decode(bytes: &[u8]) -> Result<MultiTransferJob, JobStoreError> {
        serde_json::from_slice(bytes).map_err(|e| JobStoreError::Storage(e.to_string()))
    }
}

impl JobBackend for BlobJobBackend {
    fn load(&self, job_id: JobId) -> Result<Option<MultiTransferJob>, JobStoreError> {
        self.blobs
            .get(&Self::key(job_id))?
            .map(|bytes| Self::decode(&bytes))
            .transpose()
    }

    fn save(&mut self, job: &MultiTransferJob) -> Result<(), JobStoreError> {
        let bytes = serde_json::to_vec(job).map_err(|e| JobStoreError::Storage(e.to_string()))?;
        self.blobs.put(&Self::key(job.job_id()), bytes)?;
        Ok(())
    }

    fn remove(&mut self, job_id: JobId) -> Result<Option<MultiTransferJob>, JobStoreError> {
        let existing = self.load(job_id)?;
        if existing.is_some() {
            self.blobs.delete(&Self::key(job_id), &[])?;
        }
        Ok(existing)
    }

    fn all(&self) -> Result<Vec<MultiTransferJob>, JobStoreError> {
        self.blobs
            .find_by_prefix(Self::KEY_PREFIX)?
            .iter()
            .map(|(_, bytes)| Self::decode(bytes))
            .collect()
    }
}

/// [`JobStore`] over any [`JobBackend`], serializing writers with a lock.
pub struct LockingJobStore<B> {
    backend: RwLock<B>,
}

pub type InMemoryJobStore = LockingJobStore<InMemoryJobBackend>;
pub type BlobJobStore = LockingJobStore<BlobJobBackend>;

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_backend(InMemoryJobBackend::default())
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobJobStore {
    pub fn from_blobs(blobs: Arc<dyn BlobPersistence>) -> Self {
        Self::with_backend(BlobJobBackend::new(blobs))
    }
}

fn poisoned() -> JobStoreError {
    JobStoreError::Storage("lock poisoned".to_string())
}

impl<B: JobBackend> LockingJobStore<B> {
    pub fn with_backend(backend: B) -> Self {
        Self {
            backend: RwLock::new(backend),
        }
    }

    /// Load, mutate and save one job under the write lock.
    ///
    /// The job is only written back when `f` actually changed it.
    fn modify<T>(
        &self,
        job_id: JobId,
        f: impl FnOnce(&mut MultiTransferJob) -> Result<T, JobStoreError>,
    ) -> Result<T, JobStoreError> {
        let mut backend = self.backend.write().map_err(|_| poisoned())?;
        let mut job = backend.load(job_id)?.ok_or(JobStoreError::NotFound(job_id))?;
        let before = job.clone();
        let out = f(&mut job)?;
        if job != before {
            backend.save(&job)?;
        }
        Ok(out)
    }

    fn filter(
        &self,
        predicate: impl Fn(&MultiTransferJob) -> bool,
    ) -> Result<Vec<MultiTransferJob>, JobStoreError> {
        let backend = self.backend.read().map_err(|_| poisoned())?;
        let mut jobs: Vec<_> = backend.all()?.into_iter().filter(|j| predicate(j)).collect();
        jobs.sort_by_key(|j| j.job.created_on);
        Ok(jobs)
    }
}

/// Move a drained `RUNNING` job to `TRANSFERS_FINISHED`.
fn finish_if_drained(job: &mut MultiTransferJob) -> Result<bool, JobStoreError> {
    if job.is_drained() && job.state() == JobState::Running {
        transition(job, JobState::TransfersFinished)?;
        debug!(job_id = %job.job_id(), "all transfers finished");
        return Ok(true);
    }
    Ok(false)
}

fn transition(job: &mut MultiTransferJob, to: JobState) -> Result<(), JobStoreError> {
    let job_id = job.job_id();
    job.job
        .transition(to)
        .map_err(|_| JobStoreError::InvalidState {
            job_id,
            from: job.state(),
            to,
        })
}

impl<B: JobBackend> JobStore for LockingJobStore<B> {
    fn create(&self, mut job: MultiTransferJob) -> Result<MultiTransferJob, JobStoreError> {
        let mut backend = self.backend.write().map_err(|_| poisoned())?;
        let job_id = job.job_id();
        if backend.load(job_id)?.is_some() {
            return Err(JobStoreError::AlreadyExists(job_id));
        }
        transition(&mut job, JobState::Initial)?;
        backend.save(&job)?;
        Ok(job)
    }

    fn find(&self, job_id: JobId) -> Result<Option<MultiTransferJob>, JobStoreError> {
        let backend = self.backend.read().map_err(|_| poisoned())?;
        backend.load(job_id)
    }

    fn find_all(&self) -> Result<Vec<MultiTransferJob>, JobStoreError> {
        self.filter(|_| true)
    }

    fn find_by_states(&self, states: &[JobState]) -> Result<Vec<MultiTransferJob>, JobStoreError> {
        self.filter(|j| states.contains(&j.state()))
    }

    fn find_by_process_id(
        &self,
        process_id: TransferProcessId,
    ) -> Result<Option<MultiTransferJob>, JobStoreError> {
        Ok(self
            .filter(|j| j.transfer_process_ids.contains(&process_id))?
            .into_iter()
            .next())
    }

    fn find_by_state_and_completion_older_than(
        &self,
        state: JobState,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<MultiTransferJob>, JobStoreError> {
        self.filter(|j| {
            j.state() == state && j.job.completed_on.is_some_and(|completed| completed < cutoff)
        })
    }

    fn transition_running(&self, job_id: JobId) -> Result<MultiTransferJob, JobStoreError> {
        self.modify(job_id, |job| {
            transition(job, JobState::Running)?;
            Ok(job.clone())
        })
    }

    fn add_transfer_process(
        &self,
        job_id: JobId,
        process_id: TransferProcessId,
    ) -> Result<bool, JobStoreError> {
        self.modify(job_id, |job| {
            if job.job.is_terminal() {
                warn!(job_id = %job_id, process_id = %process_id, state = ?job.state(), "not registering transfer on finished job");
                return Ok(false);
            }
            Ok(job.transfer_process_ids.insert(process_id))
        })
    }

    fn claim_transfer_process(
        &self,
        job_id: JobId,
        process_id: TransferProcessId,
    ) -> Result<Option<MultiTransferJob>, JobStoreError> {
        match self.modify(job_id, |job| {
            if job.state() != JobState::Running
                || !job.transfer_process_ids.contains(&process_id)
                || !job.claimed_process_ids.insert(process_id)
            {
                return Ok(None);
            }
            Ok(Some(job.clone()))
        }) {
            Err(JobStoreError::NotFound(_)) => Ok(None),
            other => other,
        }
    }

    fn complete_transfer_process(
        &self,
        job_id: JobId,
        process_id: TransferProcessId,
    ) -> Result<bool, JobStoreError> {
        self.modify(job_id, |job| {
            job.claimed_process_ids.remove(&process_id);
            if job.transfer_process_ids.remove(&process_id) {
                job.completed_transfers.push(process_id);
            }
            finish_if_drained(job)
        })
    }

    fn release_transfer_process(
        &self,
        job_id: JobId,
        process_id: TransferProcessId,
    ) -> Result<bool, JobStoreError> {
        match self.modify(job_id, |job| {
            if !job.job.is_terminal() || !job.transfer_process_ids.remove(&process_id) {
                return Ok(false);
            }
            job.claimed_process_ids.remove(&process_id);
            job.released_transfers.push(process_id);
            Ok(true)
        }) {
            Err(JobStoreError::NotFound(_)) => Ok(false),
            other => other,
        }
    }

    fn finish_seeding(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        self.modify(job_id, |job| {
            job.seeding = false;
            finish_if_drained(job)
        })
    }

    fn complete_job(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        self.modify(job_id, |job| {
            if job.state() != JobState::TransfersFinished {
                return Ok(false);
            }
            transition(job, JobState::Completed)?;
            Ok(true)
        })
    }

    fn mark_job_in_error(
        &self,
        job_id: JobId,
        error: ProcessingError,
    ) -> Result<bool, JobStoreError> {
        self.modify(job_id, |job| {
            if !job.state().can_transition_to(JobState::Error) {
                return Ok(false);
            }
            job.job.fail(error).map_err(|_| JobStoreError::InvalidState {
                job_id,
                from: job.state(),
                to: JobState::Error,
            })?;
            Ok(true)
        })
    }

    fn cancel_job_if(
        &self,
        job_id: JobId,
        allowed: &dyn Fn(JobState) -> bool,
    ) -> Result<Option<StateChange>, JobStoreError> {
        match self.modify(job_id, |job| {
            let changed = !job.job.is_terminal() && allowed(job.state());
            if changed {
                transition(job, JobState::Cancelled)?;
            }
            Ok(StateChange {
                job: job.clone(),
                changed,
            })
        }) {
            Ok(change) => Ok(Some(change)),
            Err(JobStoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn delete_job(&self, job_id: JobId) -> Result<Option<MultiTransferJob>, JobStoreError> {
        let mut backend = self.backend.write().map_err(|_| poisoned())?;
        backend.remove(job_id)
    }

    fn update_data(&self, job_id: JobId, updates: Vec<DataUpdate>) -> Result<(), JobStoreError> {
        if updates.is_empty() {
            return Ok(());
        }
        self.modify(job_id, |job| {
            for update in updates {
                update.apply(&mut job.data);
            }
            Ok(())
        })
    }
}

impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    fn create(&self, job: MultiTransferJob) -> Result<MultiTransferJob, JobStoreError> {
        (**self).create(job)
    }

    fn find(&self, job_id: JobId) -> Result<Option<MultiTransferJob>, JobStoreError> {
        (**self).find(job_id)
    }

    fn find_all(&self) -> Result<Vec<MultiTransferJob>, JobStoreError> {
        (**self).find_all()
    }

    fn find_by_states(&self, states: &[JobState]) -> Result<Vec<MultiTransferJob>, JobStoreError> {
        (**self).find_by_states(states)
    }

    fn find_by_process_id(
        &self,
        process_id: TransferProcessId,
    ) -> Result<Option<MultiTransferJob>, JobStoreError> {
        (**self).find_by_process_id(process_id)
    }

    fn find_by_state_and_completion_older_than(
        &self,
        state: JobState,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<MultiTransferJob>, JobStoreError> {
        (**self).find_by_state_and_completion_older_than(state, cutoff)
    }

    fn transition_running(&self, job_id: JobId) -> Result<MultiTransferJob, JobStoreError> {
        (**self).transition_running(job_id)
    }

    fn add_transfer_process(
        &self,
        job_id: JobId,
        process_id: TransferProcessId,
    ) -> Result<bool, JobStoreError> {
        (**self).add_transfer_process(job_id, process_id)
    }

    fn claim_transfer_process(
        &self,
        job_id: JobId,
        process_id: TransferProcessId,
    ) -> Result<Option<MultiTransferJob>, JobStoreError> {
        (**self).claim_transfer_process(job_id, process_id)
    }

    fn complete_transfer_process(
        &self,
        job_id: JobId,
        process_id: TransferProcessId,
    ) -> Result<bool, JobStoreError> {
        (**self).complete_transfer_process(job_id, process_id)
    }

    fn finish_seeding(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        (**self).finish_seeding(job_id)
    }

    fn complete_job(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        (**self).complete_job(job_id)
    }

    fn mark_job_in_error(
        &self,
        job_id: JobId,
        error: ProcessingError,
    ) -> Result<bool, JobStoreError> {
        (**self).mark_job_in_error(job_id, error)
    }

    fn cancel_job(&self, job_id: JobId) -> Result<Option<StateChange>, JobStoreError> {
        (**self).cancel_job(job_id)
    }

    fn cancel_job_if(
        &self,
        job_id: JobId,
        allowed: &dyn Fn(JobState) -> bool,
    ) -> Result<Option<StateChange>, JobStoreError> {
        (**self).cancel_job_if(job_id, allowed)
    }

    fn release_transfer_process(
        &self,
        job_id: JobId,
        process_id: TransferProcessId,
    ) -> Result<bool, JobStoreError> {
        (**self).release_transfer_process(job_id, process_id)
    }

    fn delete_job(&self, job_id: JobId) -> Result<Option<MultiTransferJob>, JobStoreError> {
        (**self).delete_job(job_id)
    }

    fn update_data(&self, job_id: JobId, updates: Vec<DataUpdate>) -> Result<(), JobStoreError> {
        (**self).update_data(job_id, updates)
    }
}
