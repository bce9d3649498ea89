//! Requests and transfer outcomes of item-graph jobs.

use serde::{Deserialize, Serialize};

use partchain_core::{ItemKey, JobId, TransferProcessId};
use partchain_jobs::{DataRequest, TransferProcess};

/// Fetch everything about one item found at `depth` in the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDataRequest {
    pub key: ItemKey,
    pub depth: u32,
}

impl ItemDataRequest {
    pub fn root(key: ItemKey) -> Self {
        Self { key, depth: 0 }
    }

    pub fn child(key: ItemKey, parent_depth: u32) -> Self {
        Self {
            key,
            depth: parent_depth + 1,
        }
    }
}

impl DataRequest for ItemDataRequest {}

/// Outcome of one item transfer.
///
/// The collected data itself is stored as a blob under the process id;
/// this only carries what the handler needs to recurse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemTransferProcess {
    pub id: TransferProcessId,
    pub job_id: JobId,
    pub depth: u32,
    /// Linked items discovered by this transfer.
    pub ids_to_process: Vec<ItemKey>,
}

impl ItemTransferProcess {
    pub fn new(id: TransferProcessId, job_id: JobId, depth: u32) -> Self {
        Self {
            id,
            job_id,
            depth,
            ids_to_process: Vec::new(),
        }
    }

    pub fn add_ids_to_process(&mut self, keys: impl IntoIterator<Item = ItemKey>) {
        self.ids_to_process.extend(keys);
    }
}

impl TransferProcess for ItemTransferProcess {
    fn id(&self) -> TransferProcessId {
        self.id
    }

    fn job_id(&self) -> JobId {
        self.job_id
    }
}
