//! Recursive expansion of item-graph jobs.

use std::sync::Arc;

use tracing::{debug, warn};

use partchain_core::TransferProcessId;
use partchain_jobs::{
    BlobPersistence, DataUpdate, Expansion, HandlerError, MultiTransferJob, RecursiveJobHandler,
};

use crate::assembler::ItemTreesAssembler;
use crate::model::ItemContainer;
use crate::request::{ItemDataRequest, ItemTransferProcess};

/// Data bag key counting the items requested so far.
pub const DISCOVERED_ITEMS: &str = "discovered_items";

/// Read the containers stored by `process_ids`, in order.
///
/// A transfer whose container is missing contributed nothing and is
/// skipped; an unreadable container is an error.
pub fn load_containers(
    blob_store: &dyn BlobPersistence,
    process_ids: &[TransferProcessId],
) -> Result<Vec<ItemContainer>, HandlerError> {
    let mut containers = Vec::with_capacity(process_ids.len());
    for process_id in process_ids {
        let key = process_id.to_string();
        let Some(bytes) = blob_store
            .get(&key)
            .map_err(|e| HandlerError::Assembly(e.to_string()))?
        else {
            warn!(process_id = %process_id, "no container stored for transfer");
            continue;
        };
        let container = serde_json::from_slice(&bytes)
            .map_err(|e| HandlerError::Assembly(format!("container {key}: {e}")))?;
        containers.push(container);
    }
    Ok(containers)
}

/// Starts at the root item, follows linked items down to the requested
/// depth, and assembles the collected containers into one graph.
pub struct ItemGraphHandler {
    blob_store: Arc<dyn BlobPersistence>,
    assembler: ItemTreesAssembler,
}

impl ItemGraphHandler {
    pub fn new(blob_store: Arc<dyn BlobPersistence>) -> Self {
        Self {
            blob_store,
            assembler: ItemTreesAssembler,
        }
    }
}

impl RecursiveJobHandler<ItemDataRequest, ItemTransferProcess> for ItemGraphHandler {
    fn initiate(&self, job: &MultiTransferJob) -> Result<Expansion<ItemDataRequest>, HandlerError> {
        let key = job.job.key.clone();
        if key.global_asset_id.trim().is_empty() {
            return Err(HandlerError::Initiate("root item has no global asset id".to_string()));
        }
        Ok(Expansion::new(vec![ItemDataRequest::root(key)])
            .with_update(DataUpdate::increment(DISCOVERED_ITEMS, 1)))
    }

    fn recurse(
        &self,
        job: &MultiTransferJob,
        process: &ItemTransferProcess,
    ) -> Result<Expansion<ItemDataRequest>, HandlerError> {
        let depth = job.job.parameters.depth;
        if process.depth >= depth || process.ids_to_process.is_empty() {
            return Ok(Expansion::empty());
        }

        let requests: Vec<_> = process
            .ids_to_process
            .iter()
            .cloned()
            .map(|key| ItemDataRequest::child(key, process.depth))
            .collect();
        debug!(
            job_id = %job.job_id(),
            process_id = %process.id,
            children = requests.len(),
            depth = process.depth + 1,
            "requesting linked items"
        );
        let discovered = requests.len() as i64;
        Ok(Expansion::new(requests).with_update(DataUpdate::increment(DISCOVERED_ITEMS, discovered)))
    }

    fn complete(&self, job: &MultiTransferJob) -> Result<Vec<u8>, HandlerError> {
        let containers = load_containers(self.blob_store.as_ref(), &job.completed_transfers)?;
        let graph = self.assembler.assemble(containers);
        debug!(
            job_id = %job.job_id(),
            shells = graph.shells.len(),
            relationships = graph.relationships.len(),
            tombstones = graph.tombstones.len(),
            "item graph assembled"
        );
        serde_json::to_vec(&graph).map_err(|e| HandlerError::Assembly(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Shell;
    use partchain_core::{ItemKey, Job, JobParameters};
    use partchain_jobs::InMemoryBlobStore;

    fn job(depth: u32) -> MultiTransferJob {
        MultiTransferJob::new(
            Job::new(
                ItemKey::new("urn:uuid:root", "BPNL1"),
                JobParameters::default().with_depth(depth),
                None,
            ),
            None,
        )
    }

    fn process(job: &MultiTransferJob, depth: u32, children: &[&str]) -> ItemTransferProcess {
        let mut process = ItemTransferProcess::new(TransferProcessId::new(), job.job_id(), depth);
        process.add_ids_to_process(children.iter().map(|c| ItemKey::new(*c, "BPNL1")));
        process
    }

    #[test]
    fn initiate_requests_the_root_at_depth_zero() {
        let handler = ItemGraphHandler::new(InMemoryBlobStore::arc());
        let expansion = handler.initiate(&job(2)).unwrap();
        assert_eq!(
            expansion.requests,
            vec![ItemDataRequest::root(ItemKey::new("urn:uuid:root", "BPNL1"))]
        );
        assert_eq!(expansion.data, vec![DataUpdate::increment(DISCOVERED_ITEMS, 1)]);
    }

    #[test]
    fn blank_root_cannot_be_initiated() {
        let handler = ItemGraphHandler::new(InMemoryBlobStore::arc());
        let mut job = job(1);
        job.job.key = ItemKey::without_bpn(" ");
        assert!(matches!(handler.initiate(&job), Err(HandlerError::Initiate(_))));
    }

    #[test]
    fn children_are_requested_one_level_deeper() {
        let handler = ItemGraphHandler::new(InMemoryBlobStore::arc());
        let job = job(2);

        let expansion = handler.recurse(&job, &process(&job, 0, &["a", "b"])).unwrap();
        let depths: Vec<_> = expansion.requests.iter().map(|r| r.depth).collect();
        assert_eq!(depths, vec![1, 1]);
        assert_eq!(expansion.data, vec![DataUpdate::increment(DISCOVERED_ITEMS, 2)]);
    }

    #[test]
    fn recursion_stops_at_the_requested_depth() {
        let handler = ItemGraphHandler::new(InMemoryBlobStore::arc());
        let job = job(2);
        let expansion = handler.recurse(&job, &process(&job, 2, &["deep"])).unwrap();
        assert!(expansion.requests.is_empty());
        assert!(expansion.data.is_empty());
    }

    #[test]
    fn complete_assembles_stored_containers_and_skips_missing_ones() {
        let blobs = InMemoryBlobStore::arc();
        let handler = ItemGraphHandler::new(blobs.clone());
        let mut job = job(1);

        let stored = TransferProcessId::new();
        let container = ItemContainer {
            shells: vec![Shell {
                id: "shell:root".into(),
                global_asset_id: "urn:uuid:root".into(),
                id_short: None,
                submodel_descriptors: vec![],
            }],
            ..ItemContainer::default()
        };
        blobs
            .put(&stored.to_string(), serde_json::to_vec(&container).unwrap())
            .unwrap();
        job.completed_transfers = vec![stored, TransferProcessId::new()];

        let bytes = handler.complete(&job).unwrap();
        let graph: ItemContainer = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(graph, container);
    }

    #[test]
    fn unreadable_container_fails_assembly() {
        let blobs = InMemoryBlobStore::arc();
        let handler = ItemGraphHandler::new(blobs.clone());
        let mut job = job(1);
        let broken = TransferProcessId::new();
        blobs.put(&broken.to_string(), b"not json".to_vec()).unwrap();
        job.completed_transfers = vec![broken];

        assert!(matches!(handler.complete(&job), Err(HandlerError::Assembly(_))));
    }
}
