//! Transfer process management: run data requests on a bounded pool and
//! report each finished transfer through a callback.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::runtime::{Handle, TryCurrentError};
use tokio::sync::Semaphore;
use tracing::{debug, error};

use partchain_core::{JobId, JobParameters, TransferProcessId};

use crate::types::{ResponseStatus, TransferInitiateResponse};

/// Invoked exactly once per dispatched transfer with its outcome.
pub type CompletionCallback<P> = Arc<dyn Fn(P) + Send + Sync>;

/// What a worker knows about the job it works for.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferContext {
    pub job_id: JobId,
    pub parameters: JobParameters,
}

pub trait TransferProcessManager<R, P>: Send + Sync {
    /// Generate a process id, hand it to `register`, and, if registration
    /// succeeds, execute `request` asynchronously.
    ///
    /// `register` runs synchronously before any work is dispatched, so the
    /// id is tracked before the completion callback can possibly fire. When
    /// `register` returns `false` nothing is dispatched and the response is
    /// `NotAccepted`.
    fn initiate_request(
        &self,
        request: R,
        context: &TransferContext,
        register: &dyn Fn(TransferProcessId) -> bool,
        on_complete: CompletionCallback<P>,
    ) -> TransferInitiateResponse;
}

/// Executes one data request.
///
/// Workers never fail: fetch problems are recorded inside the returned
/// process (e.g. as tombstones).
#[async_trait]
pub trait TransferWorker<R, P>: Send + Sync + 'static {
    async fn execute(&self, request: R, process_id: TransferProcessId, context: TransferContext)
    -> P;

    /// Outcome to report when `execute` did not finish (it panicked or was
    /// aborted).
    fn abandoned(
        &self,
        request: &R,
        process_id: TransferProcessId,
        context: &TransferContext,
        reason: &str,
    ) -> P;
}

/// Runs transfers on the tokio runtime, at most `pool_size` at a time.
pub struct PooledTransferProcessManager<W> {
    worker: Arc<W>,
    permits: Arc<Semaphore>,
    runtime: Handle,
}

impl<W> PooledTransferProcessManager<W> {
    pub fn new(worker: Arc<W>, pool_size: usize, runtime: Handle) -> Self {
        Self {
            worker,
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
            runtime,
        }
    }

    /// Bind to the runtime of the calling context.
    pub fn from_current(worker: Arc<W>, pool_size: usize) -> Result<Self, TryCurrentError> {
        Ok(Self::new(worker, pool_size, Handle::try_current()?))
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

impl<R, P, W> TransferProcessManager<R, P> for PooledTransferProcessManager<W>
where
    R: Clone + Send + Sync + 'static,
    P: Send + 'static,
    W: TransferWorker<R, P>,
{
    fn initiate_request(
        &self,
        request: R,
        context: &TransferContext,
        register: &dyn Fn(TransferProcessId) -> bool,
        on_complete: CompletionCallback<P>,
    ) -> TransferInitiateResponse {
        let process_id = TransferProcessId::new();
        if !register(process_id) {
            return TransferInitiateResponse {
                process_id,
                status: ResponseStatus::NotAccepted,
            };
        }

        let worker = Arc::clone(&self.worker);
        let permits = Arc::clone(&self.permits);
        let context = context.clone();

        self.runtime.spawn(async move {
            // The semaphore is never closed.
            let permit = permits.acquire_owned().await.ok();
            debug!(job_id = %context.job_id, process_id = %process_id, "transfer started");

            let fallback = request.clone();
            let task_worker = Arc::clone(&worker);
            let task_context = context.clone();
            let outcome = tokio::spawn(async move {
                task_worker.execute(request, process_id, task_context).await
            })
            .await;

            drop(permit);

            let process = match outcome {
                Ok(process) => process,
                Err(e) => {
                    error!(job_id = %context.job_id, process_id = %process_id, error = %e, "transfer worker did not finish");
                    worker.abandoned(&fallback, process_id, &context, &e.to_string())
                }
            };

            on_complete(process);
        });

        TransferInitiateResponse {
            process_id,
            status: ResponseStatus::Ok,
        }
    }
}
