use std::path::Path;

use libcubesat_core::hash::content_hash;
use libcubesat_core::types::ids::short_hash;
use libcubesat_core::{ContentAddressedStore, ContentHash, CubeError};
use tracing::debug;

use crate::error::StoreError;

/// Content-addressed object store backed by a sled tree
///
/// Keys are the 32-byte BLAKE2b-256 digest of the value, so inserting the
/// same bytes twice is a no-op.
pub struct SledObjectStore {
    db: sled::Db,
    objects: sled::Tree,
}

impl std::fmt::Debug for SledObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledObjectStore")
            .field("objects", &self.objects.len())
            .finish()
    }
}

impl SledObjectStore {
    /// Open or create a store at the given path
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let objects = db.open_tree("objects")?;
        Ok(Self { db, objects })
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn get_object(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(bytes) = self.objects.get(hash)? else {
            return Ok(None);
        };
        if content_hash(&bytes) != *hash {
            return Err(StoreError::Corrupt(format!(
                "object {} does not match its address",
                short_hash(hash)
            )));
        }
        Ok(Some(bytes.to_vec()))
    }

    fn put_object(&self, bytes: &[u8]) -> Result<ContentHash, StoreError> {
        let hash = content_hash(bytes);
        if self.objects.insert(hash, bytes)?.is_none() {
            debug!(hash = %short_hash(&hash), size = bytes.len(), "stored object");
        }
        Ok(hash)
    }
}

impl ContentAddressedStore for SledObjectStore {
    fn get(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, CubeError> {
        Ok(self.get_object(hash)?)
    }

    fn put(&self, bytes: &[u8]) -> Result<ContentHash, CubeError> {
        Ok(self.put_object(bytes)?)
    }

    fn contains(&self, hash: &ContentHash) -> Result<bool, CubeError> {
        Ok(self.objects.contains_key(hash).map_err(StoreError::from)?)
    }
}
