//! Wiring of the item-graph engine.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use partchain_jobs::{
    BatchProgressTracker, BatchStore, BlobBatchStore, BlobJobStore, BlobPersistence,
    CancelBatchProcessingService, InMemoryBatchStore, InMemoryBlobStore, InMemoryJobStore,
    JobConfig, JobStore, PooledTransferProcessManager, TimeoutSchedulerBatchProcessingService,
};

use crate::batch::BatchOrderService;
use crate::clients::{DigitalTwinRegistry, SemanticsHub, SubmodelClient};
use crate::handler::ItemGraphHandler;
use crate::service::{ItemGraphOrchestrator, ItemGraphQueryService};
use crate::worker::ItemTransferWorker;

/// Every component of a running engine, wired together.
pub struct ItemGraphEngine {
    pub config: JobConfig,
    pub blob_store: Arc<dyn BlobPersistence>,
    pub job_store: Arc<dyn JobStore>,
    pub batch_store: Arc<dyn BatchStore>,
    pub orchestrator: Arc<ItemGraphOrchestrator>,
    pub query: Arc<ItemGraphQueryService>,
    pub batches: BatchOrderService,
    pub cancel: Arc<CancelBatchProcessingService>,
}

impl ItemGraphEngine {
    pub fn builder(config: JobConfig, submodels: Arc<dyn SubmodelClient>) -> ItemGraphEngineBuilder {
        ItemGraphEngineBuilder {
            config,
            registries: Vec::new(),
            submodels,
            semantics: None,
            blob_store: InMemoryBlobStore::arc(),
            durable_stores: false,
        }
    }

    /// Periodically delete expired jobs, as configured.
    pub fn spawn_cleanup(&self) -> JoinHandle<()> {
        self.orchestrator.spawn_cleanup(
            self.config.cleanup_interval,
            self.config.completed_job_ttl,
            self.config.failed_job_ttl,
        )
    }
}

pub struct ItemGraphEngineBuilder {
    config: JobConfig,
    registries: Vec<Arc<dyn DigitalTwinRegistry>>,
    submodels: Arc<dyn SubmodelClient>,
    semantics: Option<Arc<dyn SemanticsHub>>,
    blob_store: Arc<dyn BlobPersistence>,
    durable_stores: bool,
}

impl ItemGraphEngineBuilder {
    pub fn with_registry(mut self, registry: Arc<dyn DigitalTwinRegistry>) -> Self {
        self.registries.push(registry);
        self
    }

    pub fn with_semantics_hub(mut self, hub: Arc<dyn SemanticsHub>) -> Self {
        self.semantics = Some(hub);
        self
    }

    pub fn with_blob_store(mut self, blob_store: Arc<dyn BlobPersistence>) -> Self {
        self.blob_store = blob_store;
        self
    }

    /// Keep jobs and batches in the blob store instead of in memory.
    pub fn with_durable_stores(mut self) -> Self {
        self.durable_stores = true;
        self
    }

    /// Wire the engine; transfers and timers run on `runtime`.
    pub fn build(self, runtime: Handle) -> ItemGraphEngine {
        let blob_store = self.blob_store;
        let (job_store, batch_store): (Arc<dyn JobStore>, Arc<dyn BatchStore>) =
            if self.durable_stores {
                (
                    Arc::new(BlobJobStore::from_blobs(Arc::clone(&blob_store))),
                    Arc::new(BlobBatchStore::new(Arc::clone(&blob_store))),
                )
            } else {
                (InMemoryJobStore::arc(), InMemoryBatchStore::arc())
            };

        let mut worker = ItemTransferWorker::new(
            self.registries,
            self.submodels,
            Arc::clone(&blob_store),
        )
        .with_retry_policy(self.config.retry_policy.clone());
        if let Some(hub) = self.semantics {
            worker = worker.with_semantics_hub(hub);
        }
        let manager = Arc::new(PooledTransferProcessManager::new(
            Arc::new(worker),
            self.config.worker_pool_size,
            runtime.clone(),
        ));

        let tracker = Arc::new(BatchProgressTracker::new(
            Arc::clone(&batch_store),
            Arc::clone(&job_store),
        ));
        let orchestrator = Arc::new(
            ItemGraphOrchestrator::new(
                manager,
                Arc::clone(&job_store),
                Arc::new(ItemGraphHandler::new(Arc::clone(&blob_store))),
                Arc::clone(&blob_store),
            )
            .with_listener(tracker.clone()),
        );

        let query = Arc::new(ItemGraphQueryService::new(
            Arc::clone(&orchestrator),
            Arc::clone(&blob_store),
        ));
        let cancel = Arc::new(CancelBatchProcessingService::new(
            orchestrator.clone(),
            Arc::clone(&batch_store),
        ));
        let scheduler = Arc::new(TimeoutSchedulerBatchProcessingService::new(
            Arc::clone(&cancel),
            runtime,
        ));
        let batches = BatchOrderService::new(
            Arc::clone(&query),
            Arc::clone(&batch_store),
            Arc::clone(&job_store),
            tracker,
            scheduler,
            self.config.clone(),
        );

        ItemGraphEngine {
            config: self.config,
            blob_store,
            job_store,
            batch_store,
            orchestrator,
            query,
            batches,
            cancel,
        }
    }
}
