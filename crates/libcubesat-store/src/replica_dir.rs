//! Replicas persisted in a directory
//!
//! Layout:
//!
//! ```text
//! <dir>/config.toml    replica id, name, last published content id
//! <dir>/objects/       sled object store (log entries and manifests)
//! <dir>/index/         sled document index
//! <dir>/replica.lock   exclusive lock held while open
//! ```

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fs2::FileExt;
use libcubesat_core::config::{load_replica_config, save_replica_config, ReplicaConfig};
use libcubesat_core::{ContentId, CubeError, Replica};
use tracing::info;

use crate::error::StoreError;
use crate::index::SledIndex;
use crate::objects::SledObjectStore;

pub const LOCK_FILE: &str = "replica.lock";
pub const OBJECTS_DIR: &str = "objects";
pub const INDEX_DIR: &str = "index";

/// A replica opened from a directory, with an exclusive filesystem lock.
///
/// The lock is held for the lifetime of this struct and released when
/// dropped, so two processes never open the same sled databases at once.
pub struct LockedReplica {
    // fields drop in order: the databases close before the lock is released
    replica: Replica,
    objects: Arc<SledObjectStore>,
    index: Arc<SledIndex>,
    dir: PathBuf,
    config: Mutex<ReplicaConfig>,
    /// Lock file handle - flock released on drop
    _lock_file: File,
}

impl std::fmt::Debug for LockedReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedReplica")
            .field("dir", &self.dir)
            .field("replica", &self.replica)
            .finish()
    }
}

impl LockedReplica {
    /// Open or create a replica directory (non-blocking lock)
    ///
    /// `name` is only used when the directory holds no config yet.
    /// Returns `StoreError::DbBusy` if another handle holds the lock.
    pub fn open(dir: &Path, name: &str) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let lock_file = File::create(dir.join(LOCK_FILE))?;
        lock_file.try_lock_exclusive().map_err(|e| {
            StoreError::DbBusy(format!("Replica locked by another process: {}", e))
        })?;
        Self::open_with_lock(dir, name, lock_file)
    }

    /// Open a replica directory, retrying with exponential backoff until the
    /// lock is acquired or `timeout` expires.
    pub fn open_blocking(dir: &Path, name: &str, timeout: Duration) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let lock_file = File::create(dir.join(LOCK_FILE))?;

        let start = Instant::now();
        let mut delay = Duration::from_millis(10);

        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => break,
                Err(_) if start.elapsed() < timeout => {
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(Duration::from_millis(200));
                }
                Err(e) => {
                    return Err(StoreError::DbBusy(format!(
                        "Timeout waiting for replica lock: {}",
                        e
                    )))
                }
            }
        }

        Self::open_with_lock(dir, name, lock_file)
    }

    fn open_with_lock(dir: &Path, name: &str, lock_file: File) -> Result<Self, StoreError> {
        let config = match load_replica_config(dir)? {
            Some(config) => config,
            None => {
                let config = ReplicaConfig::new(name);
                save_replica_config(dir, &config)?;
                info!(dir = %dir.display(), replica_id = %config.replica_id, "created replica");
                config
            }
        };

        let objects = Arc::new(SledObjectStore::open(&dir.join(OBJECTS_DIR))?);
        let index = Arc::new(SledIndex::open(&dir.join(INDEX_DIR))?);
        let replica = Replica::with_config(&config, objects.clone(), index.clone())?;

        info!(
            dir = %dir.display(),
            name = %config.name,
            entries = replica.log().size(),
            "opened replica"
        );
        Ok(Self {
            replica,
            objects,
            index,
            dir: dir.to_path_buf(),
            config: Mutex::new(config),
            _lock_file: lock_file,
        })
    }

    /// Get a reference to the inner Replica
    pub fn inner(&self) -> &Replica {
        &self.replica
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current configuration
    pub fn config(&self) -> Result<ReplicaConfig, StoreError> {
        Ok(self
            .config
            .lock()
            .map_err(|_| CubeError::Internal("config lock poisoned".to_string()))?
            .clone())
    }

    /// Publish the log and record its content id so the next open resumes from it
    pub fn checkpoint(&self) -> Result<ContentId, StoreError> {
        let id = self.replica.to_content_id()?;
        let mut config = self
            .config
            .lock()
            .map_err(|_| CubeError::Internal("config lock poisoned".to_string()))?;
        config.set_last_content_id(&id);
        save_replica_config(&self.dir, &config)?;
        self.flush()?;
        info!(content_id = %id, "checkpointed replica");
        Ok(id)
    }

    /// Flush both sled databases
    pub fn flush(&self) -> Result<(), StoreError> {
        self.objects.flush()?;
        self.index.flush()?;
        Ok(())
    }
}

impl std::ops::Deref for LockedReplica {
    type Target = Replica;

    fn deref(&self) -> &Self::Target {
        &self.replica
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libcubesat_core::Document;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_layout() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("cube");
        let replica = LockedReplica::open(&root, "cube").unwrap();

        assert!(root.join(LOCK_FILE).exists());
        assert!(root.join("config.toml").exists());
        assert_eq!(replica.name(), "cube");
        assert!(replica.config().unwrap().last_content_id.is_none());
    }

    #[test]
    fn test_second_open_fails() {
        let dir = tempdir().unwrap();

        let _first = LockedReplica::open(dir.path(), "cube").unwrap();

        let result = LockedReplica::open(dir.path(), "cube");
        match result.unwrap_err() {
            StoreError::DbBusy(msg) => assert!(msg.contains("locked")),
            other => panic!("Expected DbBusy error, got {:?}", other),
        }
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempdir().unwrap();
        {
            let _replica = LockedReplica::open(dir.path(), "cube").unwrap();
        }
        let _again = LockedReplica::open(dir.path(), "cube").unwrap();
    }

    #[test]
    fn test_blocking_open_times_out() {
        let dir = tempdir().unwrap();
        let _first = LockedReplica::open(dir.path(), "cube").unwrap();

        let result = LockedReplica::open_blocking(dir.path(), "cube", Duration::from_millis(50));
        match result.unwrap_err() {
            StoreError::DbBusy(msg) => assert!(msg.contains("Timeout")),
            other => panic!("Expected DbBusy timeout error, got {:?}", other),
        }
    }

    #[test]
    fn test_checkpoint_and_reopen() {
        let dir = tempdir().unwrap();
        let (replica_id, id) = {
            let replica = LockedReplica::open(dir.path(), "cube").unwrap();
            replica.post(Document::new().with("a", "b")).unwrap();
            replica.post(Document::new().with("c", "d")).unwrap();
            let id = replica.checkpoint().unwrap();
            (*replica.replica_id(), id)
        };

        let reopened = LockedReplica::open(dir.path(), "ignored").unwrap();
        assert_eq!(reopened.name(), "cube");
        assert_eq!(*reopened.replica_id(), replica_id);
        assert_eq!(reopened.log().size(), 2);
        assert_eq!(reopened.hash().unwrap(), id);
        assert_eq!(reopened.documents().unwrap().len(), 2);
    }

    #[test]
    fn test_checkpoint_empty_replica_not_ready() {
        let dir = tempdir().unwrap();
        let replica = LockedReplica::open(dir.path(), "cube").unwrap();
        assert!(matches!(
            replica.checkpoint(),
            Err(StoreError::Core(CubeError::NotReady(_)))
        ));
    }
}
