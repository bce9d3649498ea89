//! Job orchestration: start jobs, react to finished transfers, finish jobs.
//!
//! ## Flow
//!
//! 1. `start_job` creates the job (`INITIAL`), moves it to `RUNNING`, asks the
//!    handler for the initial requests and dispatches them. While that
//!    happens the job is marked as seeding, so it cannot finish early.
//! 2. Every finished transfer arrives in `transfer_process_completed`. The
//!    transfer is claimed, the handler derives follow-up requests, those are
//!    dispatched and registered, and only then is the finished transfer
//!    removed from the in-flight set.
//! 3. The removal that empties the in-flight set moves the job to
//!    `TRANSFERS_FINISHED`. That caller assembles the result, stores it under
//!    the job id and completes the job.
//!
//! All job mutations go through the [`JobStore`], which serializes them.
//! Cancellation and completion race there: the first terminal transition
//! wins, and a later one is a no-op.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use partchain_core::{
    BatchId, ItemKey, Job, JobId, JobParameters, JobState, ProcessingError, TransferProcessId,
};

use crate::blob::BlobPersistence;
use crate::events::{JobEventListener, JobProcessingFinished};
use crate::handler::{HandlerError, RecursiveJobHandler};
use crate::store::{JobStore, JobStoreError};
use crate::timeouts::JobControl;
use crate::transfer::{CompletionCallback, TransferContext, TransferProcessManager};
use crate::types::{
    DataRequest, DataUpdate, JobInitiateResponse, MultiTransferJob, ResponseStatus,
    TransferProcess,
};

#[derive(Debug, Clone, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error("transfer was not accepted: {0:?}")]
    TransferRejected(ResponseStatus),
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

impl OrchestratorError {
    fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::Store(_) => "JobStoreError",
            OrchestratorError::TransferRejected(_) => "TransferRejected",
            OrchestratorError::Handler(e) => e.kind(),
        }
    }
}

pub struct JobOrchestrator<R, P> {
    process_manager: Arc<dyn TransferProcessManager<R, P>>,
    job_store: Arc<dyn JobStore>,
    handler: Arc<dyn RecursiveJobHandler<R, P>>,
    blob_store: Arc<dyn BlobPersistence>,
    listeners: Vec<Arc<dyn JobEventListener>>,
}

impl<R, P> JobOrchestrator<R, P>
where
    R: DataRequest,
    P: TransferProcess,
{
    pub fn new(
        process_manager: Arc<dyn TransferProcessManager<R, P>>,
        job_store: Arc<dyn JobStore>,
        handler: Arc<dyn RecursiveJobHandler<R, P>>,
        blob_store: Arc<dyn BlobPersistence>,
    ) -> Self {
        Self {
            process_manager,
            job_store,
            handler,
            blob_store,
            listeners: Vec::new(),
        }
    }

    /// Notify `listener` whenever a job reaches a terminal state.
    pub fn with_listener(mut self, listener: Arc<dyn JobEventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn job_store(&self) -> &Arc<dyn JobStore> {
        &self.job_store
    }

    /// Create a job for `key` and dispatch its initial requests.
    ///
    /// Never panics on failure: a job whose handler or dispatch fails is
    /// moved to `ERROR` and the response carries `FATAL_ERROR`.
    pub fn start_job(
        self: &Arc<Self>,
        key: ItemKey,
        parameters: JobParameters,
        batch_id: Option<BatchId>,
        owner: Option<String>,
    ) -> JobInitiateResponse {
        let job = MultiTransferJob::new(Job::new(key, parameters, owner), batch_id);
        let job_id = job.job_id();

        if let Err(e) = self.job_store.create(job) {
            error!(job_id = %job_id, error = %e, "failed to create job");
            return JobInitiateResponse::fatal(job_id, e.to_string());
        }

        let job = match self.job_store.transition_running(job_id) {
            Ok(job) => job,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to start job");
                return JobInitiateResponse::fatal(job_id, e.to_string());
            }
        };
        info!(job_id = %job_id, root = %job.job.key.global_asset_id, depth = job.job.parameters.depth, "job started");

        let seeded = self
            .handler
            .initiate(&job)
            .map_err(OrchestratorError::from)
            .and_then(|expansion| {
                self.apply_data(job_id, expansion.data);
                self.start_transfers(&job, expansion.requests)
            });

        match seeded {
            Ok(count) => debug!(job_id = %job_id, transfers = count, "initial transfers dispatched"),
            Err(e) => {
                self.fail_job(job_id, &e);
                return JobInitiateResponse::fatal(job_id, e.to_string());
            }
        }

        match self.job_store.finish_seeding(job_id) {
            Ok(true) => self.complete_job(job_id),
            Ok(false) => {}
            Err(e) => error!(job_id = %job_id, error = %e, "failed to finish seeding"),
        }

        JobInitiateResponse::ok(job_id)
    }

    /// Completion callback for one transfer.
    ///
    /// Stale and duplicate completions (unknown job, job no longer running,
    /// transfer already handled) are ignored.
    pub fn transfer_process_completed(self: &Arc<Self>, process: P) {
        let process_id = process.id();
        let job_id = process.job_id();

        let job = match self.job_store.claim_transfer_process(job_id, process_id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                match self.job_store.release_transfer_process(job_id, process_id) {
                    Ok(true) => debug!(job_id = %job_id, process_id = %process_id, "released transfer of finished job"),
                    Ok(false) => info!(job_id = %job_id, process_id = %process_id, "ignoring completion of transfer that is no longer tracked"),
                    Err(e) => warn!(job_id = %job_id, process_id = %process_id, error = %e, "failed to release transfer"),
                }
                return;
            }
            Err(e) => {
                error!(job_id = %job_id, process_id = %process_id, error = %e, "failed to claim transfer");
                return;
            }
        };
        debug!(job_id = %job_id, process_id = %process_id, "transfer completed");

        let expanded = self
            .handler
            .recurse(&job, &process)
            .map_err(OrchestratorError::from)
            .and_then(|expansion| {
                self.apply_data(job_id, expansion.data);
                self.start_transfers(&job, expansion.requests)
            });
        if let Err(e) = expanded {
            self.fail_job(job_id, &e);
            if let Err(e) = self.job_store.release_transfer_process(job_id, process_id) {
                warn!(job_id = %job_id, process_id = %process_id, error = %e, "failed to release transfer");
            }
            return;
        }

        match self.job_store.complete_transfer_process(job_id, process_id) {
            Ok(true) => self.complete_job(job_id),
            Ok(false) => {}
            Err(e) => error!(job_id = %job_id, process_id = %process_id, error = %e, "failed to complete transfer"),
        }
    }

    /// Cancel a job that has not yet reached a terminal state.
    ///
    /// Returns the job as it is after the call, or `None` if it is unknown.
    pub fn cancel_job(&self, job_id: JobId) -> Result<Option<MultiTransferJob>, JobStoreError> {
        self.cancel_where(job_id, &|state| !state.is_terminal())
    }

    /// Cancel a job only while it is still `UNSAVED`, `INITIAL` or `RUNNING`.
    ///
    /// A job that already reached `TRANSFERS_FINISHED` is assembling its
    /// result and is left to finish.
    pub fn cancel_unfinished_job(
        &self,
        job_id: JobId,
    ) -> Result<Option<MultiTransferJob>, JobStoreError> {
        self.cancel_where(job_id, &|state| state.is_cancellable())
    }

    fn cancel_where(
        &self,
        job_id: JobId,
        allowed: &dyn Fn(JobState) -> bool,
    ) -> Result<Option<MultiTransferJob>, JobStoreError> {
        let change = match self.job_store.cancel_job_if(job_id, allowed)? {
            Some(change) => change,
            None => return Ok(None),
        };
        if change.changed {
            info!(job_id = %job_id, "job cancelled");
            self.notify(&change.job);
        } else {
            debug!(job_id = %job_id, state = ?change.job.state(), "job not cancelled in its current state");
        }
        Ok(Some(change.job))
    }

    /// Delete `COMPLETED` jobs that finished more than `ttl` ago, with their blobs.
    pub fn find_and_cleanup_completed_jobs(&self, ttl: Duration) -> Vec<MultiTransferJob> {
        self.cleanup(&[JobState::Completed], ttl)
    }

    /// Delete `ERROR` and `CANCELLED` jobs that finished more than `ttl` ago.
    pub fn find_and_cleanup_failed_jobs(&self, ttl: Duration) -> Vec<MultiTransferJob> {
        self.cleanup(&[JobState::Error, JobState::Cancelled], ttl)
    }

    /// Run both cleanups every `interval` on the current tokio runtime.
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        completed_ttl: Duration,
        failed_ttl: Duration,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let completed = this.find_and_cleanup_completed_jobs(completed_ttl).len();
                let failed = this.find_and_cleanup_failed_jobs(failed_ttl).len();
                if completed + failed > 0 {
                    info!(completed, failed, "expired jobs cleaned up");
                }
            }
        })
    }

    fn cleanup(&self, states: &[JobState], ttl: Duration) -> Vec<MultiTransferJob> {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let mut removed = Vec::new();

        for state in states {
            let expired = match self
                .job_store
                .find_by_state_and_completion_older_than(*state, cutoff)
            {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(state = ?state, error = %e, "failed to look up expired jobs");
                    continue;
                }
            };

            for job in expired {
                let job_id = job.job_id();
                let process_keys: Vec<String> =
                    job.all_process_ids().iter().map(|id| id.to_string()).collect();
                if let Err(e) = self.blob_store.delete(&job_id.to_string(), &process_keys) {
                    warn!(job_id = %job_id, error = %e, "failed to delete job blobs");
                }
                match self.job_store.delete_job(job_id) {
                    Ok(Some(job)) => removed.push(job),
                    Ok(None) => {}
                    Err(e) => warn!(job_id = %job_id, error = %e, "failed to delete job"),
                }
            }
        }

        removed
    }

    /// Dispatch `requests` for `job`, registering each transfer before it runs.
    fn start_transfers(
        self: &Arc<Self>,
        job: &MultiTransferJob,
        requests: Vec<R>,
    ) -> Result<usize, OrchestratorError> {
        if requests.is_empty() {
            return Ok(0);
        }

        let job_id = job.job_id();
        let context = TransferContext {
            job_id,
            parameters: job.job.parameters.clone(),
        };
        let this = Arc::clone(self);
        let on_complete: CompletionCallback<P> =
            Arc::new(move |process| this.transfer_process_completed(process));

        let store = Arc::clone(&self.job_store);
        let register = move |process_id: TransferProcessId| match store.add_transfer_process(job_id, process_id) {
            Ok(added) => added,
            Err(e) => {
                error!(job_id = %job_id, process_id = %process_id, error = %e, "failed to register transfer");
                false
            }
        };

        let count = requests.len();
        for request in requests {
            debug!(job_id = %job_id, request = ?request, "dispatching request");
            let response = self.process_manager.initiate_request(
                request,
                &context,
                &register,
                Arc::clone(&on_complete),
            );
            if response.status != ResponseStatus::Ok {
                return Err(OrchestratorError::TransferRejected(response.status));
            }
        }
        Ok(count)
    }

    fn apply_data(&self, job_id: JobId, updates: Vec<DataUpdate>) {
        if let Err(e) = self.job_store.update_data(job_id, updates) {
            warn!(job_id = %job_id, error = %e, "failed to update job data");
        }
    }

    /// Assemble and store the result of a drained job, then complete it.
    fn complete_job(&self, job_id: JobId) {
        let job = match self.job_store.find(job_id) {
            Ok(Some(job)) if job.state() == JobState::TransfersFinished => job,
            Ok(_) => {
                debug!(job_id = %job_id, "job left TRANSFERS_FINISHED before completion");
                return;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to load finished job");
                return;
            }
        };

        let stored = self.handler.complete(&job).and_then(|result| {
            self.blob_store
                .put(&job_id.to_string(), result)
                .map_err(|e| HandlerError::Persistence(e.to_string()))
        });
        if let Err(e) = stored {
            self.fail_job(job_id, &OrchestratorError::Handler(e));
            return;
        }

        match self.job_store.complete_job(job_id) {
            Ok(true) => {
                info!(job_id = %job_id, transfers = job.completed_transfers.len(), "job completed");
                self.notify_by_id(job_id);
            }
            Ok(false) => info!(job_id = %job_id, "job finished elsewhere before completion"),
            Err(e) => error!(job_id = %job_id, error = %e, "failed to complete job"),
        }
    }

    fn fail_job(&self, job_id: JobId, err: &OrchestratorError) {
        let processing_error = ProcessingError::new(err.to_string()).with_exception(err.kind());
        match self.job_store.mark_job_in_error(job_id, processing_error) {
            Ok(true) => {
                error!(job_id = %job_id, error = %err, "job failed");
                self.notify_by_id(job_id);
            }
            Ok(false) => warn!(job_id = %job_id, error = %err, "job already finished, error not recorded"),
            Err(e) => error!(job_id = %job_id, error = %e, "failed to record job error"),
        }
    }

    fn notify_by_id(&self, job_id: JobId) {
        match self.job_store.find(job_id) {
            Ok(Some(job)) => self.notify(&job),
            Ok(None) => {}
            Err(e) => warn!(job_id = %job_id, error = %e, "failed to load job for notification"),
        }
    }

    fn notify(&self, job: &MultiTransferJob) {
        let event = JobProcessingFinished::from_job(job);
        for listener in &self.listeners {
            listener.on_job_processing_finished(&event);
        }
    }
}

impl<R, P> JobControl for JobOrchestrator<R, P>
where
    R: DataRequest,
    P: TransferProcess,
{
    fn job_state(&self, job_id: JobId) -> Option<JobState> {
        match self.job_store.find(job_id) {
            Ok(job) => job.map(|j| j.state()),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "failed to load job state");
                None
            }
        }
    }

    fn cancel(&self, job_id: JobId) -> bool {
        match self.cancel_unfinished_job(job_id) {
            Ok(Some(job)) => job.state() == JobState::Cancelled,
            Ok(None) => false,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to cancel job");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::events::testing::RecordingListener;
    use crate::handler::Expansion;
    use crate::store::InMemoryJobStore;
    use crate::types::TransferInitiateResponse;

    #[derive(Debug, Clone)]
    struct Req {
        fanout: u32,
    }

    impl DataRequest for Req {}

    #[derive(Debug, Clone)]
    struct Proc {
        id: TransferProcessId,
        job_id: JobId,
        fanout: u32,
    }

    impl TransferProcess for Proc {
        fn id(&self) -> TransferProcessId {
            self.id
        }

        fn job_id(&self) -> JobId {
            self.job_id
        }
    }

    type Pending = (Proc, CompletionCallback<Proc>);

    /// Records dispatched requests; tests decide when each one finishes.
    #[derive(Default)]
    struct ManualManager {
        pending: Mutex<VecDeque<Pending>>,
        refuse: AtomicBool,
    }

    impl ManualManager {
        fn take_next(&self) -> Option<Pending> {
            self.pending.lock().unwrap().pop_front()
        }

        fn complete_next(&self) -> bool {
            match self.take_next() {
                Some((process, callback)) => {
                    callback(process);
                    true
                }
                None => false,
            }
        }

        fn drain(&self) -> usize {
            let mut completed = 0;
            while self.complete_next() {
                completed += 1;
            }
            completed
        }

        fn in_flight(&self) -> usize {
            self.pending.lock().unwrap().len()
        }
    }

    impl TransferProcessManager<Req, Proc> for ManualManager {
        fn initiate_request(
            &self,
            request: Req,
            context: &TransferContext,
            register: &dyn Fn(TransferProcessId) -> bool,
            on_complete: CompletionCallback<Proc>,
        ) -> TransferInitiateResponse {
            let process_id = TransferProcessId::new();
            if self.refuse.load(Ordering::SeqCst) || !register(process_id) {
                return TransferInitiateResponse {
                    process_id,
                    status: ResponseStatus::NotAccepted,
                };
            }
            let process = Proc {
                id: process_id,
                job_id: context.job_id,
                fanout: request.fanout,
            };
            self.pending.lock().unwrap().push_back((process, on_complete));
            TransferInitiateResponse {
                process_id,
                status: ResponseStatus::Ok,
            }
        }
    }

    /// Builds a tree: every node with fanout `n` has `n` children of fanout `n - 1`.
    #[derive(Default)]
    struct TreeHandler {
        roots: Vec<u32>,
        fail_initiate: bool,
        fail_recurse: bool,
        fail_complete: bool,
    }

    impl RecursiveJobHandler<Req, Proc> for TreeHandler {
        fn initiate(&self, _job: &MultiTransferJob) -> Result<Expansion<Req>, HandlerError> {
            if self.fail_initiate {
                return Err(HandlerError::Initiate("no root".into()));
            }
            Ok(self.roots.iter().map(|&fanout| Req { fanout }).collect::<Vec<_>>().into())
        }

        fn recurse(
            &self,
            _job: &MultiTransferJob,
            process: &Proc,
        ) -> Result<Expansion<Req>, HandlerError> {
            if self.fail_recurse {
                return Err(HandlerError::Recurse("children unreadable".into()));
            }
            let children: Vec<_> = (0..process.fanout)
                .map(|_| Req {
                    fanout: process.fanout - 1,
                })
                .collect();
            let discovered = children.len() as i64;
            Ok(Expansion::new(children).with_update(DataUpdate::increment("discovered", discovered)))
        }

        fn complete(&self, job: &MultiTransferJob) -> Result<Vec<u8>, HandlerError> {
            if self.fail_complete {
                return Err(HandlerError::Assembly("corrupt partial result".into()));
            }
            Ok(job.completed_transfers.len().to_string().into_bytes())
        }
    }

    struct Fixture {
        orchestrator: Arc<JobOrchestrator<Req, Proc>>,
        manager: Arc<ManualManager>,
        store: Arc<InMemoryJobStore>,
        blobs: Arc<InMemoryBlobStore>,
        listener: Arc<RecordingListener>,
    }

    impl Fixture {
        fn new(handler: TreeHandler) -> Self {
            let manager = Arc::new(ManualManager::default());
            let store = InMemoryJobStore::arc();
            let blobs = InMemoryBlobStore::arc();
            let listener = Arc::new(RecordingListener::default());
            let orchestrator = Arc::new(
                JobOrchestrator::new(
                    manager.clone(),
                    store.clone(),
                    Arc::new(handler),
                    blobs.clone(),
                )
                .with_listener(listener.clone()),
            );
            Self {
                orchestrator,
                manager,
                store,
                blobs,
                listener,
            }
        }

        fn start(&self) -> JobInitiateResponse {
            self.orchestrator.start_job(
                ItemKey::new("urn:uuid:root", "BPNL0000000001"),
                JobParameters::default(),
                None,
                None,
            )
        }

        fn job(&self, job_id: JobId) -> MultiTransferJob {
            self.store.find(job_id).unwrap().unwrap()
        }
    }

    #[test]
    fn job_without_initial_requests_completes_immediately() {
        let fx = Fixture::new(TreeHandler::default());
        let response = fx.start();

        assert!(response.is_ok());
        assert_eq!(fx.job(response.job_id).state(), JobState::Completed);
        assert_eq!(
            fx.blobs.get(&response.job_id.to_string()).unwrap(),
            Some(b"0".to_vec())
        );
        assert_eq!(fx.listener.events().len(), 1);
    }

    #[test]
    fn failing_initiate_marks_job_in_error() {
        let fx = Fixture::new(TreeHandler {
            fail_initiate: true,
            ..Default::default()
        });
        let response = fx.start();

        assert_eq!(response.status, ResponseStatus::FatalError);
        let job = fx.job(response.job_id);
        assert_eq!(job.state(), JobState::Error);
        assert_eq!(job.job.error.unwrap().exception, "InitiateFailed");
        assert_eq!(fx.listener.events()[0].state, JobState::Error);
    }

    #[test]
    fn refused_dispatch_marks_job_in_error() {
        let fx = Fixture::new(TreeHandler {
            roots: vec![1],
            ..Default::default()
        });
        fx.manager.refuse.store(true, Ordering::SeqCst);

        let response = fx.start();
        assert_eq!(response.status, ResponseStatus::FatalError);
        assert_eq!(fx.job(response.job_id).state(), JobState::Error);
    }

    #[test]
    fn tree_expansion_completes_after_last_transfer() {
        let fx = Fixture::new(TreeHandler {
            roots: vec![2],
            ..Default::default()
        });
        let job_id = fx.start().job_id;

        while fx.manager.in_flight() > 0 {
            let job = fx.job(job_id);
            assert_eq!(job.state(), JobState::Running);
            assert_eq!(job.transfer_process_ids.len(), fx.manager.in_flight());
            fx.manager.complete_next();
        }

        let job = fx.job(job_id);
        assert_eq!(job.state(), JobState::Completed);
        assert_eq!(job.completed_transfers.len(), 5);
        assert!(job.transfer_process_ids.is_empty());
        assert_eq!(job.data["discovered"], serde_json::json!(4));
        assert_eq!(
            fx.blobs.get(&job_id.to_string()).unwrap(),
            Some(b"5".to_vec())
        );

        let events = fx.listener.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state, JobState::Completed);
    }

    #[test]
    fn duplicate_completion_is_ignored() {
        let fx = Fixture::new(TreeHandler {
            roots: vec![0, 0],
            ..Default::default()
        });
        let job_id = fx.start().job_id;

        let (process, callback) = fx.manager.take_next().unwrap();
        callback(process.clone());
        callback(process);
        assert_eq!(fx.job(job_id).state(), JobState::Running);
        assert_eq!(fx.job(job_id).completed_transfers.len(), 1);

        fx.manager.drain();
        assert_eq!(fx.job(job_id).state(), JobState::Completed);
        assert_eq!(fx.listener.events().len(), 1);
    }

    #[test]
    fn completion_for_unknown_job_is_ignored() {
        let fx = Fixture::new(TreeHandler::default());
        fx.orchestrator.transfer_process_completed(Proc {
            id: TransferProcessId::new(),
            job_id: JobId::new(),
            fanout: 3,
        });
        assert_eq!(fx.manager.in_flight(), 0);
    }

    #[test]
    fn cancellation_wins_over_later_completions() {
        let fx = Fixture::new(TreeHandler {
            roots: vec![1, 1],
            ..Default::default()
        });
        let job_id = fx.start().job_id;
        fx.manager.complete_next();

        let cancelled = fx.orchestrator.cancel_job(job_id).unwrap().unwrap();
        assert_eq!(cancelled.state(), JobState::Cancelled);

        fx.manager.drain();
        assert_eq!(fx.job(job_id).state(), JobState::Cancelled);
        assert!(fx.blobs.get(&job_id.to_string()).unwrap().is_none());

        let events = fx.listener.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state, JobState::Cancelled);

        // Idempotent: a second cancel changes nothing and notifies nobody.
        fx.orchestrator.cancel_job(job_id).unwrap();
        assert_eq!(fx.listener.events().len(), 1);
    }

    #[test]
    fn late_completions_of_a_cancelled_job_are_released() {
        let fx = Fixture::new(TreeHandler {
            roots: vec![1, 1],
            ..Default::default()
        });
        let job_id = fx.start().job_id;
        fx.orchestrator.cancel_job(job_id).unwrap();
        assert_eq!(fx.job(job_id).transfer_process_ids.len(), 2);

        fx.manager.drain();
        let job = fx.job(job_id);
        assert!(job.transfer_process_ids.is_empty());
        assert!(job.completed_transfers.is_empty());
        assert_eq!(job.released_transfers.len(), 2);
        assert_eq!(job.state(), JobState::Cancelled);
    }

    #[test]
    fn failed_recursion_leaves_no_transfer_in_flight() {
        let fx = Fixture::new(TreeHandler {
            roots: vec![1],
            fail_recurse: true,
            ..Default::default()
        });
        let job_id = fx.start().job_id;
        fx.manager.drain();

        let job = fx.job(job_id);
        assert_eq!(job.state(), JobState::Error);
        assert!(job.transfer_process_ids.is_empty());
        assert!(job.claimed_process_ids.is_empty());
    }

    #[test]
    fn timeout_cancel_does_not_overtake_result_assembly() {
        let fx = Fixture::new(TreeHandler {
            roots: vec![0],
            ..Default::default()
        });
        let job_id = fx.start().job_id;
        assert_eq!(fx.orchestrator.job_state(job_id), Some(JobState::Running));

        // The last transfer drains the job between the timeout's state read
        // and its cancel.
        let (process, _callback) = fx.manager.take_next().unwrap();
        assert!(fx.store.complete_transfer_process(job_id, process.id).unwrap());

        assert!(!fx.orchestrator.cancel(job_id));
        assert_eq!(fx.job(job_id).state(), JobState::TransfersFinished);
        assert!(fx.store.complete_job(job_id).unwrap());
        assert!(fx.listener.events().is_empty());
    }

    #[test]
    fn assembly_failure_marks_job_in_error() {
        let fx = Fixture::new(TreeHandler {
            roots: vec![0],
            fail_complete: true,
            ..Default::default()
        });
        let job_id = fx.start().job_id;
        fx.manager.drain();

        let job = fx.job(job_id);
        assert_eq!(job.state(), JobState::Error);
        let error = job.job.error.unwrap();
        assert_eq!(error.exception, "AssemblyFailed");
        assert!(error.error_detail.contains("corrupt partial result"));
    }

    #[test]
    fn cleanup_removes_expired_jobs_and_blobs() {
        let fx = Fixture::new(TreeHandler {
            roots: vec![1],
            ..Default::default()
        });
        let job_id = fx.start().job_id;
        fx.manager.drain();
        for process_id in fx.job(job_id).completed_transfers {
            fx.blobs.put(&process_id.to_string(), b"{}".to_vec()).unwrap();
        }
        std::thread::sleep(Duration::from_millis(5));

        assert!(fx
            .orchestrator
            .find_and_cleanup_failed_jobs(Duration::ZERO)
            .is_empty());
        let removed = fx
            .orchestrator
            .find_and_cleanup_completed_jobs(Duration::ZERO);
        assert_eq!(removed.len(), 1);
        assert!(fx.store.find(job_id).unwrap().is_none());
        assert!(fx.blobs.is_empty());
    }

    #[test]
    fn job_control_reports_state_and_cancels() {
        let fx = Fixture::new(TreeHandler {
            roots: vec![0],
            ..Default::default()
        });
        let job_id = fx.start().job_id;

        assert_eq!(fx.orchestrator.job_state(job_id), Some(JobState::Running));
        assert!(fx.orchestrator.cancel(job_id));
        assert_eq!(fx.orchestrator.job_state(job_id), Some(JobState::Cancelled));
        assert!(!fx.orchestrator.cancel(JobId::new()));
    }
}
