//! The append-only, content-addressed operation log owned by one replica
//!
//! State lives behind an `RwLock` that is only write-locked for the final
//! insert of fully constructed entries, so readers never observe a partial
//! append or join. Appends and joins against one log are serialized by a
//! separate writer mutex; object-store I/O happens while holding only that
//! mutex.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use crate::codec::encode_entry;
use crate::error::CubeError;
use crate::merge::{compute_heads, total_order, Merger};
use crate::object_store::ContentAddressedStore;
use crate::types::entry::{LogEntry, Operation};
use crate::types::ids::{id_to_hex, short_hash, DocId, EntryHash, ReplicaId};
use crate::types::value::Document;

/// Mutable state of a log; only ever modified under the write lock
#[derive(Debug, Clone, Default)]
pub(crate) struct LogState {
    pub(crate) entries: HashMap<EntryHash, Arc<LogEntry>>,
    pub(crate) heads: BTreeSet<EntryHash>,
    /// Highest logical clock seen in this log
    pub(crate) clock: u64,
}

impl LogState {
    fn insert(&mut self, entry: Arc<LogEntry>) -> bool {
        self.clock = self.clock.max(entry.clock);
        if self.entries.contains_key(&entry.hash) {
            return false;
        }
        self.entries.insert(entry.hash, entry);
        true
    }
}

/// One operation submitted to [`OperationLog::append_batch`]
#[derive(Debug, Clone)]
pub struct PendingOp {
    pub operation: Operation,
    pub doc_id: DocId,
    pub payload: Option<Document>,
}

impl PendingOp {
    pub fn put(doc_id: impl Into<DocId>, payload: Document) -> Self {
        Self {
            operation: Operation::Put,
            doc_id: doc_id.into(),
            payload: Some(payload),
        }
    }

    pub fn del(doc_id: impl Into<DocId>) -> Self {
        Self {
            operation: Operation::Del,
            doc_id: doc_id.into(),
            payload: None,
        }
    }
}

/// Statistics from a join
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinStats {
    /// Entries new to this log
    pub entries_added: usize,
    /// Of those, how many were resolved through the object store
    pub entries_fetched: usize,
    /// Head count after the join
    pub head_count: usize,
}

/// A point-in-time, immutable view of a log in replay order
#[derive(Debug, Clone)]
pub struct LogSnapshot {
    entries: Arc<[Arc<LogEntry>]>,
    heads: BTreeSet<EntryHash>,
    clock: u64,
}

impl LogSnapshot {
    pub(crate) fn new(entries: Vec<Arc<LogEntry>>, heads: BTreeSet<EntryHash>, clock: u64) -> Self {
        Self {
            entries: entries.into(),
            heads,
            clock,
        }
    }

    /// Entries in total order
    pub fn entries(&self) -> &[Arc<LogEntry>] {
        &self.entries
    }

    pub fn heads(&self) -> &BTreeSet<EntryHash> {
        &self.heads
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hashes in replay order; equal sequences imply equal replays
    pub fn hashes(&self) -> Vec<EntryHash> {
        self.entries.iter().map(|e| e.hash).collect()
    }
}

/// Append-only DAG of entries authored by, or merged into, one replica
pub struct OperationLog {
    replica_id: ReplicaId,
    store: Option<Arc<dyn ContentAddressedStore>>,
    /// Upper bound on entries resolved through the store per join/load
    fetch_limit: Option<usize>,
    writer: Mutex<()>,
    state: RwLock<LogState>,
}

impl std::fmt::Debug for OperationLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationLog")
            .field("replica_id", &id_to_hex(&self.replica_id))
            .field("store", &self.store.as_ref().map(|_| "ContentAddressedStore { ... }"))
            .field("size", &self.size())
            .finish()
    }
}

impl OperationLog {
    /// Create an empty, storeless log for a replica
    pub fn new(replica_id: ReplicaId) -> Self {
        Self {
            replica_id,
            store: None,
            fetch_limit: None,
            writer: Mutex::new(()),
            state: RwLock::new(LogState::default()),
        }
    }

    /// Create an empty log that writes entries through to `store`
    pub fn with_store(replica_id: ReplicaId, store: Arc<dyn ContentAddressedStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new(replica_id)
        }
    }

    /// Bound the number of entries fetched from the store by one join/load
    pub fn with_fetch_limit(mut self, limit: Option<usize>) -> Self {
        self.fetch_limit = limit;
        self
    }

    pub(crate) fn from_state(
        replica_id: ReplicaId,
        store: Option<Arc<dyn ContentAddressedStore>>,
        fetch_limit: Option<usize>,
        state: LogState,
    ) -> Self {
        Self {
            replica_id,
            store,
            fetch_limit,
            writer: Mutex::new(()),
            state: RwLock::new(state),
        }
    }

    pub fn replica_id(&self) -> &ReplicaId {
        &self.replica_id
    }

    pub fn store(&self) -> Option<&Arc<dyn ContentAddressedStore>> {
        self.store.as_ref()
    }

    pub fn fetch_limit(&self) -> Option<usize> {
        self.fetch_limit
    }

    /// Append one operation; parents are the current head set
    pub fn append(
        &self,
        operation: Operation,
        doc_id: impl Into<DocId>,
        payload: Option<Document>,
    ) -> Result<Arc<LogEntry>, CubeError> {
        let mut entries = self.append_batch(vec![PendingOp {
            operation,
            doc_id: doc_id.into(),
            payload,
        }])?;
        entries
            .pop()
            .ok_or_else(|| CubeError::Internal("append produced no entry".to_string()))
    }

    /// Append several operations as one atomic chain
    ///
    /// Each entry's parent is its predecessor in the batch; the first entry's
    /// parents are the current heads. Either every entry becomes visible or
    /// none does.
    pub fn append_batch(&self, ops: Vec<PendingOp>) -> Result<Vec<Arc<LogEntry>>, CubeError> {
        if ops.is_empty() {
            return Err(CubeError::InvalidArgs("cannot append an empty batch".to_string()));
        }
        for op in &ops {
            validate_op(op)?;
        }

        let _writer = self.lock_writer()?;
        let (mut parents, mut clock) = {
            let state = self.read_state()?;
            (state.heads.clone(), state.clock)
        };

        let mut built = Vec::with_capacity(ops.len());
        for op in ops {
            clock += 1;
            let entry = Arc::new(LogEntry::new(
                clock,
                self.replica_id,
                parents,
                op.operation,
                op.doc_id,
                op.payload,
            ));
            parents = BTreeSet::from([entry.hash]);
            built.push(entry);
        }

        if let Some(store) = &self.store {
            for entry in &built {
                let address = store.put(&encode_entry(entry))?;
                if address != entry.hash {
                    return Err(CubeError::Store(format!(
                        "store addressed entry {} as {}",
                        short_hash(&entry.hash),
                        short_hash(&address)
                    )));
                }
            }
        }

        let mut state = self.write_state()?;
        for entry in &built {
            state.insert(entry.clone());
        }
        state.heads = parents;
        drop(state);

        for entry in &built {
            debug!(
                hash = %short_hash(&entry.hash),
                clock = entry.clock,
                op = entry.operation.as_str(),
                doc_id = %entry.doc_id,
                "appended entry"
            );
        }
        Ok(built)
    }

    /// Look up an entry by hash
    pub fn get(&self, hash: &EntryHash) -> Result<Arc<LogEntry>, CubeError> {
        self.read_state()?
            .entries
            .get(hash)
            .cloned()
            .ok_or_else(|| CubeError::entry_not_found(hash))
    }

    pub fn contains(&self, hash: &EntryHash) -> bool {
        self.peek_state().entries.contains_key(hash)
    }

    /// Current frontier: entries with no successor in this log
    pub fn heads(&self) -> BTreeSet<EntryHash> {
        self.peek_state().heads.clone()
    }

    /// Number of distinct entries
    pub fn size(&self) -> usize {
        self.peek_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Highest logical clock in the log
    pub fn clock(&self) -> u64 {
        self.peek_state().clock
    }

    /// Entries in the deterministic replay order
    pub fn ordered_entries(&self) -> Result<Vec<Arc<LogEntry>>, CubeError> {
        Ok(self.snapshot()?.entries().to_vec())
    }

    /// Capture a consistent, immutable view for replay or publication
    pub fn snapshot(&self) -> Result<LogSnapshot, CubeError> {
        let state = self.read_state()?;
        let ordered = total_order(&state.entries);
        Ok(LogSnapshot::new(ordered, state.heads.clone(), state.clock))
    }

    /// Merge `other` into this log in place
    ///
    /// Ancestors that neither log holds are resolved through this log's
    /// store (one attempt each). On failure nothing is modified.
    pub fn join(&self, other: &OperationLog) -> Result<JoinStats, CubeError> {
        let incoming: Vec<Arc<LogEntry>> = {
            let other_state = other.read_state()?;
            other_state.entries.values().cloned().collect()
        };
        self.merge_entries(incoming)
    }

    /// Merge a set of entries into this log, resolving missing ancestors
    /// through this log's own store
    pub(crate) fn merge_entries(&self, incoming: Vec<Arc<LogEntry>>) -> Result<JoinStats, CubeError> {
        self.merge_entries_via(incoming, self.store.as_deref())
    }

    /// Merge a set of entries, resolving missing ancestors through `source`
    pub(crate) fn merge_entries_via(
        &self,
        incoming: Vec<Arc<LogEntry>>,
        source: Option<&dyn ContentAddressedStore>,
    ) -> Result<JoinStats, CubeError> {
        let _writer = self.lock_writer()?;

        let plan = {
            let state = self.read_state()?;
            Merger::new(source, self.fetch_limit).plan(&state.entries, incoming)?
        };

        let mut state = self.write_state()?;
        let mut added = 0;
        for entry in plan.new_entries {
            if state.insert(entry) {
                added += 1;
            }
        }
        if added > 0 {
            state.heads = compute_heads(&state.entries);
        }
        let stats = JoinStats {
            entries_added: added,
            entries_fetched: plan.fetched,
            head_count: state.heads.len(),
        };
        drop(state);

        info!(
            replica = %id_to_hex(&self.replica_id),
            added = stats.entries_added,
            fetched = stats.entries_fetched,
            heads = stats.head_count,
            "joined log"
        );
        Ok(stats)
    }

    pub(crate) fn state_clone(&self) -> Result<LogState, CubeError> {
        Ok(self.read_state()?.clone())
    }

    fn lock_writer(&self) -> Result<MutexGuard<'_, ()>, CubeError> {
        self.writer
            .lock()
            .map_err(|_| CubeError::Internal("log writer lock poisoned".to_string()))
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, LogState>, CubeError> {
        self.state
            .read()
            .map_err(|_| CubeError::Internal("log state lock poisoned".to_string()))
    }

    /// Read access for the infallible accessors
    ///
    /// Write sections only insert complete entries and then replace the
    /// head set, so the state behind a poisoned lock is still the last
    /// consistent one and is returned as-is.
    fn peek_state(&self) -> RwLockReadGuard<'_, LogState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, LogState>, CubeError> {
        self.state
            .write()
            .map_err(|_| CubeError::Internal("log state lock poisoned".to_string()))
    }
}

fn validate_op(op: &PendingOp) -> Result<(), CubeError> {
    if op.doc_id.is_empty() {
        return Err(CubeError::InvalidArgs("document id must not be empty".to_string()));
    }
    match (op.operation, &op.payload) {
        (Operation::Put, None) => Err(CubeError::InvalidArgs(format!(
            "PUT for '{}' requires a payload",
            op.doc_id
        ))),
        (Operation::Del, Some(_)) => Err(CubeError::InvalidArgs(format!(
            "DEL for '{}' must not carry a payload",
            op.doc_id
        ))),
        _ => Ok(()),
    }
}
