//! Control surface of item-graph jobs: register, inspect and cancel.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use partchain_core::{BatchId, BomLifecycle, Direction, ItemKey, Job, JobId, JobParameters, JobState};
use partchain_jobs::{
    BlobPersistence, HandlerError, JobInitiateResponse, JobOrchestrator, JobStoreError,
    MultiTransferJob,
};

use crate::assembler::ItemTreesAssembler;
use crate::handler::{DISCOVERED_ITEMS, load_containers};
use crate::model::ItemContainer;
use crate::request::{ItemDataRequest, ItemTransferProcess};

/// Aspect collected when a job asks for aspects without naming any.
pub const DEFAULT_ASPECT: &str = "SerialPart";

pub type ItemGraphOrchestrator = JobOrchestrator<ItemDataRequest, ItemTransferProcess>;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error("job result could not be read: {0}")]
    Result(String),
}

impl From<HandlerError> for QueryError {
    fn from(err: HandlerError) -> Self {
        QueryError::Result(err.to_string())
    }
}

/// A request to discover the graph below (or above) one item.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegisterJob {
    pub key: ItemKey,
    /// Defaults to [`JobParameters::DEFAULT_DEPTH`].
    pub depth: Option<u32>,
    pub aspects: Vec<String>,
    pub bom_lifecycle: BomLifecycle,
    pub direction: Direction,
    pub collect_aspects: bool,
    pub callback_url: Option<String>,
    pub owner: Option<String>,
}

impl RegisterJob {
    pub fn new(key: ItemKey) -> Self {
        Self {
            key,
            ..Self::default()
        }
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn with_aspects(mut self, aspects: Vec<String>) -> Self {
        self.aspects = aspects;
        self.collect_aspects = true;
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Validate and fill in defaults.
    pub fn parameters(&self) -> Result<JobParameters, QueryError> {
        if self.key.global_asset_id.trim().is_empty() {
            return Err(QueryError::InvalidRequest("global asset id is required".to_string()));
        }
        let depth = self.depth.unwrap_or(JobParameters::DEFAULT_DEPTH);
        if depth == 0 {
            return Err(QueryError::InvalidRequest("depth must be at least 1".to_string()));
        }
        let aspects = if self.aspects.is_empty() {
            vec![DEFAULT_ASPECT.to_string()]
        } else {
            self.aspects.clone()
        };
        Ok(JobParameters {
            depth,
            aspects,
            bom_lifecycle: self.bom_lifecycle,
            direction: self.direction,
            collect_aspects: self.collect_aspects,
            callback_url: self.callback_url.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobSummary {
    /// Transfers that finished.
    pub completed: usize,
    /// Transfers still in flight.
    pub running: usize,
    /// Items that could not be fetched.
    pub failed: usize,
}

/// A job together with its (possibly partial) graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemGraphJob {
    pub job: Job,
    pub summary: JobSummary,
    pub discovered_items: u64,
    pub graph: ItemContainer,
}

pub struct ItemGraphQueryService {
    orchestrator: Arc<ItemGraphOrchestrator>,
    blob_store: Arc<dyn BlobPersistence>,
    assembler: ItemTreesAssembler,
}

impl ItemGraphQueryService {
    pub fn new(orchestrator: Arc<ItemGraphOrchestrator>, blob_store: Arc<dyn BlobPersistence>) -> Self {
        Self {
            orchestrator,
            blob_store,
            assembler: ItemTreesAssembler,
        }
    }

    /// Start a job. Never blocks on the fetches themselves.
    pub fn register_job(&self, request: &RegisterJob) -> Result<JobInitiateResponse, QueryError> {
        self.start(request, None)
    }

    /// Start a job as a member of `batch_id`.
    pub fn register_job_in_batch(
        &self,
        request: &RegisterJob,
        batch_id: BatchId,
    ) -> Result<JobInitiateResponse, QueryError> {
        self.start(request, Some(batch_id))
    }

    fn start(
        &self,
        request: &RegisterJob,
        batch_id: Option<BatchId>,
    ) -> Result<JobInitiateResponse, QueryError> {
        let parameters = request.parameters()?;
        let response = self.orchestrator.start_job(
            request.key.clone(),
            parameters,
            batch_id,
            request.owner.clone(),
        );
        info!(
            job_id = %response.job_id,
            item = %request.key.global_asset_id,
            status = ?response.status,
            "job registered"
        );
        Ok(response)
    }

    /// The job and its graph.
    ///
    /// A completed job returns its stored result. Otherwise the graph holds
    /// what finished transfers collected so far when `include_partial` is
    /// set, and is empty when it is not.
    pub fn get_job(&self, job_id: JobId, include_partial: bool) -> Result<ItemGraphJob, QueryError> {
        let job = self
            .orchestrator
            .job_store()
            .find(job_id)?
            .ok_or(QueryError::JobNotFound(job_id))?;

        let graph = if job.state() == JobState::Completed {
            self.stored_result(job_id)?
        } else if include_partial {
            let containers = load_containers(self.blob_store.as_ref(), &job.completed_transfers)?;
            self.assembler.assemble(containers)
        } else {
            ItemContainer::default()
        };

        Ok(Self::view(job, graph))
    }

    fn stored_result(&self, job_id: JobId) -> Result<ItemContainer, QueryError> {
        let bytes = self
            .blob_store
            .get(&job_id.to_string())
            .map_err(|e| QueryError::Result(e.to_string()))?
            .ok_or_else(|| QueryError::Result(format!("no result stored for job {job_id}")))?;
        serde_json::from_slice(&bytes).map_err(|e| QueryError::Result(e.to_string()))
    }

    fn view(job: MultiTransferJob, graph: ItemContainer) -> ItemGraphJob {
        let summary = JobSummary {
            completed: job.completed_transfers.len(),
            running: job.transfer_process_ids.len(),
            failed: graph.tombstones.len(),
        };
        let discovered_items = job
            .data
            .get(DISCOVERED_ITEMS)
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        ItemGraphJob {
            job: job.job,
            summary,
            discovered_items,
            graph,
        }
    }

    /// Cancel a job. A job that already finished is returned unchanged.
    pub fn cancel_job(&self, job_id: JobId) -> Result<Job, QueryError> {
        self.orchestrator
            .cancel_job(job_id)?
            .map(|job| job.job)
            .ok_or(QueryError::JobNotFound(job_id))
    }

    /// Jobs in any of `states`, oldest first; all jobs when `states` is empty.
    pub fn jobs_by_state(&self, states: &[JobState]) -> Result<Vec<Job>, QueryError> {
        let store = self.orchestrator.job_store();
        let jobs = if states.is_empty() {
            store.find_all()?
        } else {
            store.find_by_states(states)?
        };
        Ok(jobs.into_iter().map(|job| job.job).collect())
    }
}
