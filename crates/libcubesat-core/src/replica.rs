//! Replica: a named document database over an operation log
//!
//! Every write becomes a log entry; reads go through a document index kept
//! in line with replay of the log. Two replicas converge by joining logs,
//! and a replica can be published to, or rebuilt from, a content id.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ReplicaConfig;
use crate::error::CubeError;
use crate::index::{
    AllDocsOptions, AllDocsRow, DocumentIndex, FindQuery, MemoryIndex, QueryOptions, View,
    ViewResult, ViewSource,
};
use crate::log::{JoinStats, OperationLog, PendingOp};
use crate::object_store::ContentAddressedStore;
use crate::projection::{MaterializedView, Projector, Revision};
use crate::snapshot::{ContentId, SnapshotManager};
use crate::types::entry::Operation;
use crate::types::ids::{generate_doc_id, generate_replica_id, id_to_hex, DocId, EntryHash, ReplicaId};
use crate::types::value::{Document, ID_KEY};

/// Outcome of a single document write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    pub id: DocId,
    pub rev: String,
}

/// A named, joinable document database
pub struct Replica {
    name: String,
    log: OperationLog,
    store: Arc<dyn ContentAddressedStore>,
    index: Arc<dyn DocumentIndex>,
    /// Content id this replica was seeded from
    seed: Option<ContentId>,
    /// Serializes check-then-append sequences and joins
    writer: Mutex<()>,
    view: Mutex<Option<Arc<MaterializedView>>>,
    indexed_heads: Mutex<Option<BTreeSet<EntryHash>>>,
    published: Mutex<Option<(ContentId, BTreeSet<EntryHash>)>>,
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("name", &self.name)
            .field("log", &self.log)
            .field("seed", &self.seed.map(|id| id.to_string()))
            .finish()
    }
}

impl Replica {
    /// Create an empty replica with a fresh replica id and an in-memory index
    pub fn new(name: impl Into<String>, store: Arc<dyn ContentAddressedStore>) -> Self {
        Self::with_parts(
            name,
            generate_replica_id(),
            store,
            Arc::new(MemoryIndex::new()),
            None,
        )
    }

    /// Assemble a replica from explicit parts
    pub fn with_parts(
        name: impl Into<String>,
        replica_id: ReplicaId,
        store: Arc<dyn ContentAddressedStore>,
        index: Arc<dyn DocumentIndex>,
        fetch_limit: Option<usize>,
    ) -> Self {
        let log = OperationLog::with_store(replica_id, store.clone()).with_fetch_limit(fetch_limit);
        Self {
            name: name.into(),
            log,
            store,
            index,
            seed: None,
            writer: Mutex::new(()),
            view: Mutex::new(None),
            indexed_heads: Mutex::new(None),
            published: Mutex::new(None),
        }
    }

    /// Rebuild a replica from a published content id
    pub fn from_content_id(
        name: impl Into<String>,
        id: ContentId,
        store: Arc<dyn ContentAddressedStore>,
    ) -> Result<Self, CubeError> {
        let mut replica = Self::new(name, store);
        replica.seed = Some(id);
        replica.load()?;
        Ok(replica)
    }

    /// Open a replica described by a config, loading its last content id if set
    pub fn with_config(
        config: &ReplicaConfig,
        store: Arc<dyn ContentAddressedStore>,
        index: Arc<dyn DocumentIndex>,
    ) -> Result<Self, CubeError> {
        let mut replica = Self::with_parts(
            config.name.clone(),
            config.replica_id_bytes()?,
            store,
            index,
            config.fetch_limit(),
        );
        replica.seed = config.last_content_id()?;
        if replica.seed.is_some() {
            replica.load()?;
        }
        Ok(replica)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn replica_id(&self) -> &ReplicaId {
        self.log.replica_id()
    }

    /// The underlying log, for inspection
    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn store(&self) -> &Arc<dyn ContentAddressedStore> {
        &self.store
    }

    /// Add a document, generating an `_id` if it has none
    pub fn post(&self, doc: Document) -> Result<WriteResult, CubeError> {
        single(self.post_batch(vec![doc])?)
    }

    /// Add several documents as one atomic chain of entries
    pub fn post_batch(&self, docs: Vec<Document>) -> Result<Vec<WriteResult>, CubeError> {
        let docs = docs
            .into_iter()
            .map(|mut doc| {
                if doc.id().is_none() {
                    doc.insert(ID_KEY, generate_doc_id());
                }
                doc
            })
            .collect();
        self.write_documents(docs)
    }

    /// Write a document under its `_id`
    ///
    /// If the document carries a `_rev`, it must match the current revision
    /// or the write fails with [`CubeError::Conflict`].
    pub fn put(&self, doc: Document) -> Result<WriteResult, CubeError> {
        single(self.put_batch(vec![doc])?)
    }

    pub fn put_batch(&self, docs: Vec<Document>) -> Result<Vec<WriteResult>, CubeError> {
        if let Some(missing) = docs.iter().position(|d| d.id().is_none()) {
            return Err(CubeError::InvalidArgs(format!(
                "document {} in batch is missing _id",
                missing
            )));
        }
        self.write_documents(docs)
    }

    /// Tombstone a live document
    pub fn del(&self, doc: &Document) -> Result<WriteResult, CubeError> {
        let doc_id = doc
            .id()
            .ok_or_else(|| CubeError::InvalidArgs("document is missing _id".to_string()))?;

        let _writer = lock(&self.writer)?;
        let view = self.current_view()?;
        let current = match view.state(doc_id) {
            Some(state) if !state.is_deleted() => state.revision.clone(),
            _ => return Err(CubeError::doc_not_found(doc_id)),
        };
        check_revision(doc_id, doc.rev(), Some(&current))?;

        let entry = self.log.append(Operation::Del, doc_id, None)?;
        let rev = Revision::next(Some(&current), &entry);
        debug!(doc_id, %rev, "deleted document");
        Ok(WriteResult {
            id: doc_id.to_string(),
            rev: rev.to_string(),
        })
    }

    /// Fetch a live document with `_id` and `_rev`
    pub fn get(&self, doc_id: &str) -> Result<Document, CubeError> {
        self.refresh_index()?;
        self.index.get(doc_id)
    }

    pub fn all(&self, options: &AllDocsOptions) -> Result<Vec<AllDocsRow>, CubeError> {
        self.refresh_index()?;
        self.index.list_all(options)
    }

    /// Live documents in id order
    pub fn documents(&self) -> Result<Vec<Document>, CubeError> {
        Ok(self
            .all(&AllDocsOptions::default())?
            .into_iter()
            .filter_map(|row| row.doc)
            .collect())
    }

    pub fn find(&self, query: &FindQuery) -> Result<Vec<Document>, CubeError> {
        self.refresh_index()?;
        self.index.find(query)
    }

    pub fn query(&self, source: ViewSource<'_>, options: &QueryOptions) -> Result<ViewResult, CubeError> {
        self.refresh_index()?;
        self.index.query(source, options)
    }

    pub fn register_view(&self, name: &str, view: View) -> Result<(), CubeError> {
        self.index.register_view(name, view)
    }

    /// Replay of the current log
    pub fn materialize(&self) -> Result<Arc<MaterializedView>, CubeError> {
        self.current_view()
    }

    /// Publish the log and remember its content id
    pub fn to_content_id(&self) -> Result<ContentId, CubeError> {
        let snapshot = self.log.snapshot()?;
        let id = SnapshotManager::new(self.store.as_ref()).publish(&snapshot)?;
        *lock(&self.published)? = Some((id, snapshot.heads().clone()));
        Ok(id)
    }

    /// Content id of the current log, if it was published or loaded as-is
    pub fn hash(&self) -> Result<ContentId, CubeError> {
        let published = lock(&self.published)?;
        match published.as_ref() {
            Some((id, heads)) if *heads == self.log.heads() => Ok(*id),
            _ => Err(CubeError::NotReady(format!(
                "replica '{}' does not have a hash yet",
                self.name
            ))),
        }
    }

    /// Resolve the content id this replica was seeded with
    pub fn load(&self) -> Result<JoinStats, CubeError> {
        let id = self.seed.ok_or_else(|| {
            CubeError::NotReady(format!("replica '{}' has no content id to load", self.name))
        })?;
        self.load_from(&id)
    }

    /// Merge a published log into this replica
    pub fn load_from(&self, id: &ContentId) -> Result<JoinStats, CubeError> {
        let _writer = lock(&self.writer)?;
        let manager = SnapshotManager::new(self.store.as_ref());
        let manifest = manager.read_manifest(id)?;
        let stats = manager.resolve_manifest(&self.log, &manifest)?;

        if self.log.heads() == manifest.heads {
            *lock(&self.published)? = Some((*id, manifest.heads));
        }
        info!(replica = %self.name, content_id = %id, added = stats.entries_added, "loaded");
        Ok(stats)
    }

    /// Merge another replica's log into this one
    pub fn join(&self, other: &Replica) -> Result<JoinStats, CubeError> {
        let _writer = lock(&self.writer)?;
        self.log.join(&other.log)
    }

    fn write_documents(&self, docs: Vec<Document>) -> Result<Vec<WriteResult>, CubeError> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }

        let mut seen = HashSet::with_capacity(docs.len());
        for doc in &docs {
            let id = doc.id().unwrap_or_default();
            if !seen.insert(id.to_string()) {
                return Err(CubeError::InvalidArgs(format!(
                    "document '{}' appears twice in one batch",
                    id
                )));
            }
        }

        let _writer = lock(&self.writer)?;
        let view = self.current_view()?;

        let mut ops = Vec::with_capacity(docs.len());
        let mut previous = Vec::with_capacity(docs.len());
        for doc in &docs {
            let doc_id = doc
                .id()
                .ok_or_else(|| CubeError::InvalidArgs("document is missing _id".to_string()))?;
            let current = view.revision(doc_id);
            check_revision(doc_id, doc.rev(), current)?;
            ops.push(PendingOp::put(doc_id, doc.body()));
            previous.push(current.cloned());
        }

        let entries = self.log.append_batch(ops)?;
        let results: Vec<WriteResult> = entries
            .iter()
            .zip(previous)
            .map(|(entry, prev)| WriteResult {
                id: entry.doc_id.clone(),
                rev: Revision::next(prev.as_ref(), entry).to_string(),
            })
            .collect();

        debug!(
            replica = %id_to_hex(self.log.replica_id()),
            count = results.len(),
            "wrote documents"
        );
        Ok(results)
    }

    /// Replay of the log at its current heads, reusing the last one if unchanged
    fn current_view(&self) -> Result<Arc<MaterializedView>, CubeError> {
        let heads = self.log.heads();
        let mut cached = lock(&self.view)?;
        if let Some(view) = cached.as_ref() {
            if *view.heads() == heads {
                return Ok(view.clone());
            }
        }
        let view = Arc::new(Projector::materialize_log(&self.log)?);
        *cached = Some(view.clone());
        Ok(view)
    }

    fn refresh_index(&self) -> Result<(), CubeError> {
        let view = self.current_view()?;
        let mut indexed = lock(&self.indexed_heads)?;
        if indexed.as_ref() != Some(view.heads()) {
            self.index.sync_from(&view)?;
            *indexed = Some(view.heads().clone());
        }
        Ok(())
    }
}

fn check_revision(doc_id: &str, given: Option<&str>, current: Option<&Revision>) -> Result<(), CubeError> {
    let Some(given) = given else {
        return Ok(());
    };
    match current {
        Some(rev) if rev.to_string() == given => Ok(()),
        Some(rev) => Err(CubeError::Conflict(format!(
            "document '{}' is at revision {}, not {}",
            doc_id, rev, given
        ))),
        None => Err(CubeError::Conflict(format!(
            "document '{}' does not exist; revision {} is stale",
            doc_id, given
        ))),
    }
}

fn single(mut results: Vec<WriteResult>) -> Result<WriteResult, CubeError> {
    results
        .pop()
        .ok_or_else(|| CubeError::Internal("write produced no result".to_string()))
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, CubeError> {
    mutex
        .lock()
        .map_err(|_| CubeError::Internal("replica lock poisoned".to_string()))
}
