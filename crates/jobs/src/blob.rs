//! Opaque byte storage keyed by string.
//!
//! Transfer workers write each partial result under its transfer process id;
//! the orchestrator writes the assembled result under the job id. Persistent
//! job and batch stores also serialize into blobs, under prefixed keys.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Blob persistence error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BlobPersistenceError {
    #[error("blob storage error: {0}")]
    Storage(String),
}

/// Blob store abstraction.
pub trait BlobPersistence: Send + Sync {
    /// Store `blob` under `key`, replacing any previous value.
    fn put(&self, key: &str, blob: Vec<u8>) -> Result<(), BlobPersistenceError>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobPersistenceError>;

    /// All blobs whose key starts with `prefix`, ordered by key.
    fn find_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, BlobPersistenceError>;

    /// Delete the blob for a job together with the blobs of its transfers.
    ///
    /// Returns whether anything was removed.
    fn delete(&self, job_key: &str, process_keys: &[String]) -> Result<bool, BlobPersistenceError>;
}

/// In-memory blob store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> BlobPersistenceError {
    BlobPersistenceError::Storage("lock poisoned".to_string())
}

impl BlobPersistence for InMemoryBlobStore {
    fn put(&self, key: &str, blob: Vec<u8>) -> Result<(), BlobPersistenceError> {
        let mut blobs = self.blobs.write().map_err(|_| poisoned())?;
        blobs.insert(key.to_string(), blob);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobPersistenceError> {
        let blobs = self.blobs.read().map_err(|_| poisoned())?;
        Ok(blobs.get(key).cloned())
    }

    fn find_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, BlobPersistenceError> {
        let blobs = self.blobs.read().map_err(|_| poisoned())?;
        Ok(blobs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn delete(&self, job_key: &str, process_keys: &[String]) -> Result<bool, BlobPersistenceError> {
        let mut blobs = self.blobs.write().map_err(|_| poisoned())?;
        let mut removed = blobs.remove(job_key).is_some();
        for key in process_keys {
            removed |= blobs.remove(key).is_some();
        }
        Ok(removed)
    }
}

impl<T: BlobPersistence + ?Sized> BlobPersistence for Arc<T> {
    fn put(&self, key: &str, blob: Vec<u8>) -> Result<(), BlobPersistenceError> {
        (**self).put(key, blob)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobPersistenceError> {
        (**self).get(key)
    }

    fn find_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, BlobPersistenceError> {
        (**self).find_by_prefix(prefix)
    }

    fn delete(&self, job_key: &str, process_keys: &[String]) -> Result<bool, BlobPersistenceError> {
        (**self).delete(job_key, process_keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_scan_only_returns_matching_keys() {
        let store = InMemoryBlobStore::new();
        store.put("job:1", b"a".to_vec()).unwrap();
        store.put("job:2", b"b".to_vec()).unwrap();
        store.put("batch:1", b"c".to_vec()).unwrap();

        let found = store.find_by_prefix("job:").unwrap();
        let keys: Vec<_> = found.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["job:1", "job:2"]);
    }

    #[test]
    fn delete_removes_job_and_transfer_blobs() {
        let store = InMemoryBlobStore::new();
        store.put("job", b"result".to_vec()).unwrap();
        store.put("p1", b"partial".to_vec()).unwrap();
        store.put("p2", b"partial".to_vec()).unwrap();
        store.put("other", b"keep".to_vec()).unwrap();

        let removed = store
            .delete("job", &["p1".to_string(), "p2".to_string()])
            .unwrap();
        assert!(removed);
        assert_eq!(store.len(), 1);
        assert!(store.get("other").unwrap().is_some());
    }

    #[test]
    fn delete_of_unknown_keys_reports_nothing_removed() {
        let store = InMemoryBlobStore::new();
        assert!(!store.delete("missing", &[]).unwrap());
    }
}
