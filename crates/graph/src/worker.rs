//! The transfer worker of item-graph jobs.
//!
//! One transfer collects everything about one item: its shell (raced across
//! all registries), the relationships to linked items and, when requested,
//! the submodel payloads. Every failure becomes a tombstone in the item's
//! container; the worker itself never fails.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use partchain_core::{
    ItemKey, JobParameters, ProcessStep, ProcessingError, ToErrorCause, Tombstone,
    TransferProcessId,
};
use partchain_jobs::{
    BlobPersistence, ResultFinder, RetryPolicy, TransferContext, TransferWorker, retry_with_policy,
};

use crate::clients::{DigitalTwinRegistry, FetchError, SemanticsHub, SubmodelClient};
use crate::model::{ItemContainer, RelationshipAspect, Shell, Submodel, SubmodelDescriptor};
use crate::request::{ItemDataRequest, ItemTransferProcess};

pub struct ItemTransferWorker {
    registries: Vec<Arc<dyn DigitalTwinRegistry>>,
    submodels: Arc<dyn SubmodelClient>,
    semantics: Option<Arc<dyn SemanticsHub>>,
    blob_store: Arc<dyn BlobPersistence>,
    retry_policy: RetryPolicy,
    result_finder: ResultFinder,
}

impl ItemTransferWorker {
    pub fn new(
        registries: Vec<Arc<dyn DigitalTwinRegistry>>,
        submodels: Arc<dyn SubmodelClient>,
        blob_store: Arc<dyn BlobPersistence>,
    ) -> Self {
        Self {
            registries,
            submodels,
            semantics: None,
            blob_store,
            retry_policy: RetryPolicy::default(),
            result_finder: ResultFinder,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Validate submodel payloads against the hub's schemas.
    pub fn with_semantics_hub(mut self, hub: Arc<dyn SemanticsHub>) -> Self {
        self.semantics = Some(hub);
        self
    }

    async fn collect(
        &self,
        request: &ItemDataRequest,
        parameters: &JobParameters,
        process: &mut ItemTransferProcess,
        container: &mut ItemContainer,
    ) {
        let key = &request.key;
        let Some(bpn) = key.bpn() else {
            warn!(item = %key.global_asset_id, "item has no business partner number");
            container.tombstones.push(Tombstone::from_message(
                key.global_asset_id.clone(),
                None,
                "Can't get relationship without a BPN",
                0,
                ProcessStep::DigitalTwinRequest,
            ));
            return;
        };

        let mut shell = match self.lookup_shell(key).await {
            Ok(shell) => shell,
            Err(tombstone) => {
                container.tombstones.push(*tombstone);
                return;
            }
        };

        if request.depth < parameters.depth {
            self.collect_relationships(key, &shell, parameters, process, container)
                .await;
            shell.submodel_descriptors =
                shell.filter_descriptors_by_aspect_types(&parameters.aspects);
            if parameters.collect_aspects {
                self.collect_submodels(key, bpn, &shell.submodel_descriptors, container)
                    .await;
            }
        } else {
            debug!(item = %key.global_asset_id, depth = request.depth, "depth reached, shell only");
        }

        container.shells.push(shell);
    }

    /// Race every registry; the first shell found wins.
    async fn lookup_shell(&self, key: &ItemKey) -> Result<Shell, Box<Tombstone>> {
        let attempts: Vec<_> = self
            .registries
            .iter()
            .map(|registry| {
                let registry = Arc::clone(registry);
                let key = key.clone();
                let policy = self.retry_policy.clone();
                async move {
                    retry_with_policy(
                        &policy,
                        ProcessStep::DigitalTwinRequest,
                        FetchError::is_retryable,
                        |_| registry.lookup_shell(&key),
                    )
                    .await
                }
            })
            .collect();

        let endpoints = self
            .registries
            .iter()
            .map(|registry| registry.endpoint())
            .collect::<Vec<_>>()
            .join("; ");

        match self.result_finder.get_fastest_result(Some(attempts)).await {
            Ok(Some(shell)) => Ok(shell),
            Ok(None) => Err(Box::new(
                Tombstone::from_message(
                    key.global_asset_id.clone(),
                    None,
                    "No digital twin registry configured",
                    0,
                    ProcessStep::DigitalTwinRequest,
                )
                .with_business_partner_number(key.bpn.clone()),
            )),
            Err(all_failed) => {
                let retries = all_failed.failed().map(|e| e.attempts).max().unwrap_or(0);
                warn!(item = %key.global_asset_id, registries = %endpoints, error = %all_failed, "shell lookup failed");
                Err(Box::new(
                    Tombstone::from_cause(
                        key.global_asset_id.clone(),
                        Some(endpoints),
                        &all_failed.to_error_cause(),
                        retries,
                        ProcessStep::DigitalTwinRequest,
                    )
                    .with_business_partner_number(key.bpn.clone()),
                ))
            }
        }
    }

    async fn collect_relationships(
        &self,
        key: &ItemKey,
        shell: &Shell,
        parameters: &JobParameters,
        process: &mut ItemTransferProcess,
        container: &mut ItemContainer,
    ) {
        let aspect = RelationshipAspect::from(parameters.bom_lifecycle, parameters.direction);
        for endpoint in shell.relationship_endpoints(aspect) {
            let fetched = retry_with_policy(
                &self.retry_policy,
                ProcessStep::SubmodelRequest,
                FetchError::is_retryable,
                |_| self.submodels.relationships(endpoint, aspect),
            )
            .await;

            match fetched {
                Ok(relationships) => {
                    process.add_ids_to_process(relationships.iter().map(|r| ItemKey {
                        global_asset_id: r.linked_item.child_catena_x_id.clone(),
                        bpn: r.linked_item.business_partner.clone(),
                    }));
                    container.relationships.extend(relationships);
                }
                Err(exhausted) => {
                    warn!(item = %key.global_asset_id, endpoint, error = %exhausted.error, "relationship fetch failed");
                    container.tombstones.push(
                        Tombstone::from_cause(
                            key.global_asset_id.clone(),
                            Some(endpoint.to_string()),
                            &exhausted.cause(),
                            exhausted.attempts,
                            ProcessStep::SubmodelRequest,
                        )
                        .with_business_partner_number(key.bpn.clone()),
                    );
                }
            }
        }
    }

    async fn collect_submodels(
        &self,
        key: &ItemKey,
        bpn: &str,
        descriptors: &[SubmodelDescriptor],
        container: &mut ItemContainer,
    ) {
        for descriptor in descriptors {
            match self.fetch_submodel(key, bpn, descriptor).await {
                Ok(submodel) => container.submodels.push(submodel),
                Err(tombstone) => {
                    warn!(
                        item = %key.global_asset_id,
                        endpoint = %descriptor.endpoint,
                        step = ?tombstone.processing_error.process_step,
                        "submodel could not be collected"
                    );
                    container
                        .tombstones
                        .push(tombstone.with_business_partner_number(key.bpn.clone()));
                }
            }
        }
    }

    async fn fetch_submodel(
        &self,
        key: &ItemKey,
        bpn: &str,
        descriptor: &SubmodelDescriptor,
    ) -> Result<Submodel, Tombstone> {
        let item_id = key.global_asset_id.clone();
        let endpoint = Some(descriptor.endpoint.clone());

        let payload = retry_with_policy(
            &self.retry_policy,
            ProcessStep::SubmodelRequest,
            FetchError::is_retryable,
            |_| self.submodels.submodel_payload(&descriptor.endpoint, bpn),
        )
        .await
        .map_err(|exhausted| {
            let (step, retries) = match &exhausted.error {
                FetchError::UsagePolicy(_) => (ProcessStep::UsagePolicyValidation, 0),
                FetchError::InvalidPayload(_) => {
                    (ProcessStep::SchemaValidation, self.retry_policy.max_attempts)
                }
                FetchError::Transport(_) => (ProcessStep::SubmodelRequest, exhausted.attempts),
                FetchError::NotFound(_) | FetchError::SchemaNotFound(_) => {
                    (ProcessStep::SubmodelRequest, 0)
                }
            };
            Tombstone::from_cause(item_id.clone(), endpoint.clone(), &exhausted.cause(), retries, step)
        })?;

        if let Some(hub) = &self.semantics {
            let schema = hub
                .model_schema(&descriptor.aspect_type)
                .await
                .map_err(|e| {
                    Tombstone::from_cause(
                        item_id.clone(),
                        endpoint.clone(),
                        &e.to_error_cause(),
                        0,
                        ProcessStep::SchemaRequest,
                    )
                })?;
            let errors = schema.validate(&payload);
            if !errors.is_empty() {
                return Err(Tombstone::from_message(
                    item_id,
                    endpoint,
                    format!("Submodel payload validation failed. {}", errors.join(", ")),
                    0,
                    ProcessStep::SchemaValidation,
                ));
            }
        }

        Ok(Submodel {
            id: descriptor.id.clone(),
            aspect_type: descriptor.aspect_type.clone(),
            catena_x_id: key.global_asset_id.clone(),
            payload,
        })
    }

    fn store(&self, process_id: TransferProcessId, container: &ItemContainer) {
        let stored = serde_json::to_vec(container)
            .map_err(|e| e.to_string())
            .and_then(|bytes| {
                self.blob_store
                    .put(&process_id.to_string(), bytes)
                    .map_err(|e| e.to_string())
            });
        if let Err(e) = stored {
            error!(process_id = %process_id, error = %e, "failed to store item container");
        }
    }
}

#[async_trait]
impl TransferWorker<ItemDataRequest, ItemTransferProcess> for ItemTransferWorker {
    async fn execute(
        &self,
        request: ItemDataRequest,
        process_id: TransferProcessId,
        context: TransferContext,
    ) -> ItemTransferProcess {
        let mut process = ItemTransferProcess::new(process_id, context.job_id, request.depth);
        let mut container = ItemContainer::default();

        self.collect(&request, &context.parameters, &mut process, &mut container)
            .await;
        self.store(process_id, &container);

        info!(
            job_id = %context.job_id,
            process_id = %process_id,
            item = %request.key.global_asset_id,
            depth = request.depth,
            children = process.ids_to_process.len(),
            tombstones = container.tombstones.len(),
            "item transfer finished"
        );
        process
    }

    fn abandoned(
        &self,
        request: &ItemDataRequest,
        process_id: TransferProcessId,
        context: &TransferContext,
        reason: &str,
    ) -> ItemTransferProcess {
        let container = ItemContainer {
            tombstones: vec![Tombstone {
                item_id: request.key.global_asset_id.clone(),
                business_partner_number: request.key.bpn.clone(),
                endpoint_url: None,
                // The failing fetch is unknown; attribute it to the item lookup.
                processing_error: ProcessingError::new(reason)
                    .with_exception("TransferAbandoned")
                    .with_process_step(ProcessStep::DigitalTwinRequest)
                    .with_retry_counter_and_last_attempt_now(1),
            }],
            ..ItemContainer::default()
        };
        self.store(process_id, &container);
        ItemTransferProcess::new(process_id, context.job_id, request.depth)
    }
}
