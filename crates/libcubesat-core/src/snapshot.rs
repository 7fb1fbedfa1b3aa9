//! Content identifiers for whole logs
//!
//! Publishing writes every entry's canonical bytes to the object store
//! (each lands at its own entry hash) followed by a manifest naming the
//! heads. The manifest's address is the log's content id: since entries
//! link to their parents by hash, the heads are enough to walk and rebuild
//! the entire DAG.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, info};

use crate::codec::{decode_entry, decode_manifest, encode_entry, encode_manifest, Manifest};
use crate::error::CubeError;
use crate::log::{JoinStats, LogSnapshot, OperationLog};
use crate::object_store::{ContentAddressedStore, ContentHash};
use crate::types::entry::LogEntry;
use crate::types::ids::{hex_to_id, short_hash, IdParseError, ReplicaId};

/// Prefix naming the digest used for content ids
pub const CONTENT_ID_PREFIX: &str = "b2-";

/// Address of a published log manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId(pub ContentHash);

impl ContentId {
    pub fn as_bytes(&self) -> &ContentHash {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", CONTENT_ID_PREFIX, hex::encode(self.0))
    }
}

impl FromStr for ContentId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex_part = s
            .strip_prefix(CONTENT_ID_PREFIX)
            .ok_or_else(|| IdParseError::InvalidPrefix(s.to_string()))?;
        Ok(ContentId(hex_to_id::<32>(hex_part)?))
    }
}

impl Serialize for ContentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Publishes logs to, and rebuilds logs from, a content-addressed store
pub struct SnapshotManager<'a> {
    store: &'a dyn ContentAddressedStore,
}

impl<'a> SnapshotManager<'a> {
    pub fn new(store: &'a dyn ContentAddressedStore) -> Self {
        Self { store }
    }

    /// Compute (and publish) the content id of a log
    ///
    /// Fails with [`CubeError::NotReady`] if the log has no entries.
    pub fn to_content_id(&self, log: &OperationLog) -> Result<ContentId, CubeError> {
        self.publish(&log.snapshot()?)
    }

    /// Publish a snapshot's entries and manifest
    pub fn publish(&self, snapshot: &LogSnapshot) -> Result<ContentId, CubeError> {
        if snapshot.is_empty() {
            return Err(CubeError::NotReady(
                "log does not have a hash yet: no entries".to_string(),
            ));
        }

        let mut written = 0usize;
        for entry in snapshot.entries() {
            if self.store.contains(&entry.hash)? {
                continue;
            }
            let address = self.store.put(&encode_entry(entry))?;
            if address != entry.hash {
                return Err(CubeError::Store(format!(
                    "store addressed entry {} as {}",
                    short_hash(&entry.hash),
                    short_hash(&address)
                )));
            }
            written += 1;
        }

        let manifest = Manifest {
            heads: snapshot.heads().clone(),
            entry_count: snapshot.len() as u64,
            max_clock: snapshot.clock(),
        };
        let id = ContentId(self.store.put(&encode_manifest(&manifest)?)?);

        info!(
            content_id = %id,
            entries = snapshot.len(),
            written,
            "published log"
        );
        Ok(id)
    }

    /// Read the manifest behind a content id
    pub fn read_manifest(&self, id: &ContentId) -> Result<Manifest, CubeError> {
        let bytes = self
            .store
            .get(id.as_bytes())?
            .ok_or(CubeError::Fetch { hash: id.0 })?;
        decode_manifest(&bytes)
    }

    /// Rebuild a fresh log for `replica_id` from a content id
    pub fn load_from(
        &self,
        id: &ContentId,
        replica_id: ReplicaId,
        store: Arc<dyn ContentAddressedStore>,
    ) -> Result<OperationLog, CubeError> {
        let log = OperationLog::with_store(replica_id, store);
        let manifest = self.read_manifest(id)?;
        self.resolve_manifest(&log, &manifest)?;

        if log.size() as u64 != manifest.entry_count {
            return Err(CubeError::Validation(format!(
                "manifest {} lists {} entries but {} were resolved",
                id,
                manifest.entry_count,
                log.size()
            )));
        }
        Ok(log)
    }

    /// Resolve a content id into an existing log
    ///
    /// Walks parent links from the manifest heads, stopping at entries the
    /// log already holds, so an interrupted load can be resumed without
    /// fetching anything twice.
    pub fn load_into(&self, log: &OperationLog, id: &ContentId) -> Result<JoinStats, CubeError> {
        let manifest = self.read_manifest(id)?;
        self.resolve_manifest(log, &manifest)
    }

    /// Resolve an already decoded manifest into `log`
    ///
    /// Heads and their ancestors are read from this manager's store,
    /// whatever store the log itself writes to.
    pub fn resolve_manifest(
        &self,
        log: &OperationLog,
        manifest: &Manifest,
    ) -> Result<JoinStats, CubeError> {
        let mut heads: Vec<Arc<LogEntry>> = Vec::new();
        for hash in &manifest.heads {
            if log.contains(hash) {
                continue;
            }
            let bytes = self
                .store
                .get(hash)
                .map_err(|_| CubeError::Fetch { hash: *hash })?
                .ok_or(CubeError::Fetch { hash: *hash })?;
            let entry = decode_entry(&bytes)?;
            if entry.hash != *hash {
                return Err(CubeError::Validation(format!(
                    "store returned {} for head {}",
                    short_hash(&entry.hash),
                    short_hash(hash)
                )));
            }
            heads.push(Arc::new(entry));
        }

        if heads.is_empty() {
            debug!("all manifest heads already present");
            return Ok(JoinStats {
                entries_added: 0,
                entries_fetched: 0,
                head_count: log.heads().len(),
            });
        }

        let fetched_heads = heads.len();
        let mut stats = log.merge_entries_via(heads, Some(self.store))?;
        stats.entries_fetched += fetched_heads;
        Ok(stats)
    }
}
