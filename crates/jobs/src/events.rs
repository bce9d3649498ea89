//! Job lifecycle notifications.
//!
//! Listeners are invoked synchronously by the orchestrator, once per job,
//! when the job reaches a terminal state. They must not block and must be
//! idempotent with respect to their own side effects.

use serde::{Deserialize, Serialize};

use partchain_core::{BatchId, JobId, JobState};

use crate::types::MultiTransferJob;

/// Published when a job reaches `COMPLETED`, `ERROR` or `CANCELLED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProcessingFinished {
    pub job_id: JobId,
    pub state: JobState,
    pub callback_url: Option<String>,
    pub batch_id: Option<BatchId>,
}

impl JobProcessingFinished {
    pub fn from_job(job: &MultiTransferJob) -> Self {
        Self {
            job_id: job.job_id(),
            state: job.state(),
            callback_url: job.job.parameters.callback_url.clone(),
            batch_id: job.batch_id,
        }
    }
}

pub trait JobEventListener: Send + Sync {
    fn on_job_processing_finished(&self, event: &JobProcessingFinished);
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records every event it receives.
    #[derive(Default)]
    pub struct RecordingListener {
        pub events: Mutex<Vec<JobProcessingFinished>>,
    }

    impl RecordingListener {
        pub fn events(&self) -> Vec<JobProcessingFinished> {
            self.events.lock().unwrap().clone()
        }
    }

    impl JobEventListener for RecordingListener {
        fn on_job_processing_finished(&self, event: &JobProcessingFinished) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}
