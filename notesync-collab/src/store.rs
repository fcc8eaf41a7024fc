//! Persistence collaborator interface.
//!
//! The core never depends on durable storage. When a store is wired into the
//! registry it is consulted when a document is created and written when a
//! document is evicted; it is never called while relaying messages.

use parking_lot::Mutex;
use std::collections::HashMap;
use thiserror::Error;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("snapshot for '{0}' is corrupt")]
    Corrupt(String),
}

/// Snapshot storage keyed by document name.
pub trait DocumentStore: Send + Sync {
    /// Load the last saved snapshot, or `None` if the document is unknown.
    fn load_document(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace the saved snapshot.
    fn save_document(&self, name: &str, snapshot: &[u8]) -> Result<(), StoreError>;
}

/// Process-local store, mostly useful for tests and single-node demos.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.snapshots.lock().contains_key(name)
    }
}

impl DocumentStore for MemoryStore {
    fn load_document(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.snapshots.lock().get(name).cloned())
    }

    fn save_document(&self, name: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        self.snapshots.lock().insert(name.to_string(), snapshot.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.load_document("doc-A").unwrap().is_none());

        store.save_document("doc-A", &[1, 2, 3]).unwrap();
        assert_eq!(store.load_document("doc-A").unwrap(), Some(vec![1, 2, 3]));
        assert!(store.contains("doc-A"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_memory_store_overwrites() {
        let store = MemoryStore::new();
        store.save_document("doc", &[1]).unwrap();
        store.save_document("doc", &[2]).unwrap();
        assert_eq!(store.load_document("doc").unwrap(), Some(vec![2]));
    }
}
