//! `partchain-core`: domain primitives for item-graph discovery jobs.
//!
//! This crate is pure domain: identifiers, the job state machine, tombstones
//! and batches. It has no runtime or storage concerns.

pub mod batch;
pub mod error;
pub mod id;
pub mod job;
pub mod tombstone;

pub use batch::{Batch, BatchOrder, BatchState, JobProgress};
pub use error::{DomainError, DomainResult};
pub use id::{BatchId, BatchOrderId, JobId, TransferProcessId};
pub use job::{BomLifecycle, Direction, ItemKey, Job, JobParameters, JobState};
pub use tombstone::{
    ErrorCause, ProcessStep, ProcessingError, Tombstone, ToErrorCause, root_error_messages,
};
