//! Content-addressed object store interface
//!
//! The log persists serialized entries and snapshot manifests through this
//! trait. Addresses are BLAKE2b-256 digests of the stored bytes, so `put` is
//! idempotent and identical bytes always land at the same address.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::CubeError;
use crate::hash::content_hash;
use crate::types::ids::EntryHash;

/// Address of an object in a content-addressed store
pub type ContentHash = EntryHash;

/// A content-addressed byte store shared between replicas
pub trait ContentAddressedStore: Send + Sync {
    /// Fetch the bytes stored at `hash`, `None` if absent
    fn get(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, CubeError>;

    /// Store bytes, returning their address
    fn put(&self, bytes: &[u8]) -> Result<ContentHash, CubeError>;

    /// Whether the store holds `hash`
    fn contains(&self, hash: &ContentHash) -> Result<bool, CubeError> {
        Ok(self.get(hash)?.is_some())
    }
}

impl<T: ContentAddressedStore + ?Sized> ContentAddressedStore for Arc<T> {
    fn get(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, CubeError> {
        (**self).get(hash)
    }

    fn put(&self, bytes: &[u8]) -> Result<ContentHash, CubeError> {
        (**self).put(bytes)
    }

    fn contains(&self, hash: &ContentHash) -> Result<bool, CubeError> {
        (**self).contains(hash)
    }
}

/// In-memory store, cheap to clone and share across replicas in one process
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<HashMap<ContentHash, Vec<u8>>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop an object (used to simulate unavailable peers)
    pub fn remove(&self, hash: &ContentHash) -> Option<Vec<u8>> {
        self.objects.write().ok().and_then(|mut m| m.remove(hash))
    }
}

impl ContentAddressedStore for MemoryObjectStore {
    fn get(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, CubeError> {
        let objects = self
            .objects
            .read()
            .map_err(|_| CubeError::Store("object store lock poisoned".to_string()))?;
        Ok(objects.get(hash).cloned())
    }

    fn put(&self, bytes: &[u8]) -> Result<ContentHash, CubeError> {
        let hash = content_hash(bytes);
        let mut objects = self
            .objects
            .write()
            .map_err(|_| CubeError::Store("object store lock poisoned".to_string()))?;
        objects.entry(hash).or_insert_with(|| bytes.to_vec());
        Ok(hash)
    }
}
