//! `partchain-jobs`: recursive multi-transfer job orchestration.
//!
//! ## Design
//!
//! - A job fans out into transfer processes; each finished transfer may
//!   produce follow-up requests, until no transfer is in flight
//! - Job state only moves forward; every mutation is serialized by the store
//! - Transfers run on a bounded tokio pool and report back through a callback
//! - Partial results and the final result are stored as blobs
//! - Batches group jobs; timeouts cancel whatever is still unfinished
//!
//! ## Components
//!
//! - `JobStore`: job persistence (in-memory or blob-backed)
//! - `BlobPersistence`: byte storage for partial and final results
//! - `TransferProcessManager`: dispatches data requests
//! - `RecursiveJobHandler`: the domain seam (initial requests, follow-ups, assembly)
//! - `JobOrchestrator`: drives jobs from start to a terminal state
//! - `ResultFinder` and `retry_with_policy`: fetch helpers for workers
//! - `BatchStore`, `BatchProgressTracker`, timeout and cancellation services

pub mod batch;
pub mod blob;
pub mod config;
pub mod events;
pub mod handler;
pub mod orchestrator;
pub mod result_finder;
pub mod retry;
pub mod store;
pub mod timeouts;
pub mod transfer;
pub mod types;

pub use batch::{BatchProgressTracker, BatchStore, BatchStoreError, BlobBatchStore, InMemoryBatchStore};
pub use blob::{BlobPersistence, BlobPersistenceError, InMemoryBlobStore};
pub use config::{ConfigError, JobConfig};
pub use events::{JobEventListener, JobProcessingFinished};
pub use handler::{Expansion, HandlerError, RecursiveJobHandler};
pub use orchestrator::{JobOrchestrator, OrchestratorError};
pub use result_finder::{AllAttemptsFailed, AttemptFailure, ResultFinder};
pub use retry::{RetryExhausted, retry_with_policy};
pub use store::{BlobJobStore, InMemoryJobStore, JobStore, JobStoreError, StateChange};
pub use timeouts::{CancelBatchProcessingService, JobControl, TimeoutSchedulerBatchProcessingService};
pub use transfer::{
    CompletionCallback, PooledTransferProcessManager, TransferContext, TransferProcessManager,
    TransferWorker,
};
pub use types::{
    BackoffStrategy, DataRequest, DataUpdate, JobInitiateResponse, MultiTransferJob, ResponseStatus,
    RetryPolicy, TransferInitiateResponse, TransferProcess,
};
