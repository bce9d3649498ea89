//! The domain seam of the orchestrator.
//!
//! A [`RecursiveJobHandler`] decides which requests a job starts with, which
//! follow-up requests each finished transfer produces, and how the partial
//! results are assembled once the job has drained.

use crate::types::{DataUpdate, MultiTransferJob};

/// Handler failure. Any of these moves the job to `ERROR`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    #[error("initial requests could not be built: {0}")]
    Initiate(String),
    #[error("follow-up requests could not be built: {0}")]
    Recurse(String),
    #[error("result assembly failed: {0}")]
    Assembly(String),
    #[error("result could not be persisted: {0}")]
    Persistence(String),
}

impl HandlerError {
    /// Short name recorded as the job error's exception kind.
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerError::Initiate(_) => "InitiateFailed",
            HandlerError::Recurse(_) => "RecurseFailed",
            HandlerError::Assembly(_) => "AssemblyFailed",
            HandlerError::Persistence(_) => "PersistenceFailed",
        }
    }
}

/// Requests to dispatch plus updates for the job's data bag.
#[derive(Debug, Clone, PartialEq)]
pub struct Expansion<R> {
    pub requests: Vec<R>,
    pub data: Vec<DataUpdate>,
}

impl<R> Expansion<R> {
    pub fn new(requests: Vec<R>) -> Self {
        Self {
            requests,
            data: Vec::new(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn with_update(mut self, update: DataUpdate) -> Self {
        self.data.push(update);
        self
    }
}

impl<R> From<Vec<R>> for Expansion<R> {
    fn from(requests: Vec<R>) -> Self {
        Self::new(requests)
    }
}

pub trait RecursiveJobHandler<R, P>: Send + Sync {
    /// Initial requests for a freshly started job.
    fn initiate(&self, job: &MultiTransferJob) -> Result<Expansion<R>, HandlerError>;

    /// Follow-up requests for one finished transfer. An empty expansion ends
    /// this branch.
    fn recurse(&self, job: &MultiTransferJob, process: &P) -> Result<Expansion<R>, HandlerError>;

    /// Assemble the final result from the job's completed transfers.
    fn complete(&self, job: &MultiTransferJob) -> Result<Vec<u8>, HandlerError>;
}
