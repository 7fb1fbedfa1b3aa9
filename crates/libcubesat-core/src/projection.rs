//! Deterministic replay of a log into current document state
//!
//! Replay folds the total order front to back. A later entry for the same
//! document always wins, so concurrent writes resolve last-writer-wins
//! under the `(clock, replica_id, hash)` tie-break rather than by local
//! arrival order.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CubeError;
use crate::integrity::verify_entry;
use crate::log::{LogSnapshot, OperationLog};
use crate::types::entry::{LogEntry, Operation};
use crate::types::ids::{short_hash, DocId, EntryHash};
use crate::types::value::Document;

/// Number of hash hex digits kept in a revision token
const REVISION_DISCRIMINATOR_LEN: usize = 16;

/// Revision token: `<operations applied>-<hash prefix of the last entry>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Revision {
    pub seq: u64,
    pub discriminator: String,
}

impl Revision {
    /// Revision after applying `entry` on top of `prev`
    pub fn next(prev: Option<&Revision>, entry: &LogEntry) -> Self {
        let mut discriminator = hex::encode(entry.hash);
        discriminator.truncate(REVISION_DISCRIMINATOR_LEN);
        Self {
            seq: prev.map(|r| r.seq).unwrap_or(0) + 1,
            discriminator,
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.seq, self.discriminator)
    }
}

impl FromStr for Revision {
    type Err = CubeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (seq, disc) = s
            .split_once('-')
            .ok_or_else(|| CubeError::InvalidArgs(format!("malformed revision '{}'", s)))?;
        let seq = seq
            .parse()
            .map_err(|_| CubeError::InvalidArgs(format!("malformed revision '{}'", s)))?;
        Ok(Self {
            seq,
            discriminator: disc.to_string(),
        })
    }
}

/// Current state of one document id, including tombstoned ones
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocState {
    pub doc_id: DocId,
    /// `None` once tombstoned
    pub body: Option<Document>,
    pub revision: Revision,
    /// Entry that produced the current state
    pub last_entry: EntryHash,
}

impl DocState {
    /// Create a state from the first entry seen for a document
    pub fn from_entry(entry: &LogEntry) -> Self {
        Self {
            doc_id: entry.doc_id.clone(),
            body: entry.payload.clone(),
            revision: Revision::next(None, entry),
            last_entry: entry.hash,
        }
    }

    /// Apply a later entry for the same document
    pub fn apply(&mut self, entry: &LogEntry) -> Result<(), CubeError> {
        if entry.doc_id != self.doc_id {
            return Err(CubeError::Internal(format!(
                "entry for '{}' applied to '{}'",
                entry.doc_id, self.doc_id
            )));
        }
        match entry.operation {
            Operation::Put => self.body = entry.payload.clone(),
            Operation::Del => self.body = None,
        }
        self.revision = Revision::next(Some(&self.revision), entry);
        self.last_entry = entry.hash;
        Ok(())
    }

    pub fn is_deleted(&self) -> bool {
        self.body.is_none()
    }

    /// The document with `_id` and `_rev` attached, if not tombstoned
    pub fn to_document(&self) -> Option<Document> {
        self.body
            .as_ref()
            .map(|b| b.clone().with_identity(&self.doc_id, &self.revision.to_string()))
    }
}

/// Document id → current state, derived purely from a log
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaterializedView {
    docs: BTreeMap<DocId, DocState>,
    entry_count: usize,
    heads: BTreeSet<EntryHash>,
}

impl MaterializedView {
    /// A live document with identity keys attached
    pub fn get(&self, doc_id: &str) -> Option<Document> {
        self.docs.get(doc_id).and_then(DocState::to_document)
    }

    /// State for a document id, tombstoned or not
    pub fn state(&self, doc_id: &str) -> Option<&DocState> {
        self.docs.get(doc_id)
    }

    pub fn revision(&self, doc_id: &str) -> Option<&Revision> {
        self.docs.get(doc_id).map(|s| &s.revision)
    }

    /// Live documents in ascending id order
    pub fn documents(&self) -> impl Iterator<Item = Document> + '_ {
        self.docs.values().filter_map(DocState::to_document)
    }

    /// Every document state, tombstones included, in ascending id order
    pub fn states(&self) -> impl Iterator<Item = &DocState> {
        self.docs.values()
    }

    /// Number of live documents
    pub fn len(&self) -> usize {
        self.docs.values().filter(|s| !s.is_deleted()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of log entries folded into this view
    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    /// Heads of the log this view was derived from
    pub fn heads(&self) -> &BTreeSet<EntryHash> {
        &self.heads
    }
}

/// Replays logs into materialized views
pub struct Projector;

impl Projector {
    /// Replay a snapshot; aborts on the first malformed entry
    pub fn materialize(snapshot: &LogSnapshot) -> Result<MaterializedView, CubeError> {
        let mut docs: BTreeMap<DocId, DocState> = BTreeMap::new();

        for entry in snapshot.entries() {
            if let Err(kind) = verify_entry(entry) {
                warn!(hash = %short_hash(&entry.hash), %kind, "aborting replay");
                return Err(CubeError::Validation(format!(
                    "entry {} for '{}': {}",
                    short_hash(&entry.hash),
                    entry.doc_id,
                    kind
                )));
            }

            match docs.get_mut(&entry.doc_id) {
                Some(state) => state.apply(entry)?,
                None => {
                    docs.insert(entry.doc_id.clone(), DocState::from_entry(entry));
                }
            }
        }

        debug!(entries = snapshot.len(), docs = docs.len(), "replayed log");
        Ok(MaterializedView {
            docs,
            entry_count: snapshot.len(),
            heads: snapshot.heads().clone(),
        })
    }

    /// Snapshot the log and replay it
    pub fn materialize_log(log: &OperationLog) -> Result<MaterializedView, CubeError> {
        Self::materialize(&log.snapshot()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::merge::Merger;

    fn doc(key: &str, value: &str) -> Document {
        Document::new().with(key, value)
    }

    #[test]
    fn test_put_then_put_then_delete() {
        let log = OperationLog::new([1u8; 16]);
        log.append(Operation::Put, "a", Some(doc("v", "1"))).unwrap();
        let view = Projector::materialize_log(&log).unwrap();
        assert_eq!(view.get("a").unwrap().get("v").unwrap().as_str(), Some("1"));
        assert_eq!(view.revision("a").unwrap().seq, 1);

        log.append(Operation::Put, "a", Some(doc("v", "2"))).unwrap();
        let view = Projector::materialize_log(&log).unwrap();
        assert_eq!(view.get("a").unwrap().get("v").unwrap().as_str(), Some("2"));
        assert_eq!(view.revision("a").unwrap().seq, 2);

        log.append(Operation::Del, "a", None).unwrap();
        let view = Projector::materialize_log(&log).unwrap();
        assert!(view.get("a").is_none());
        assert!(view.state("a").unwrap().is_deleted());
        assert_eq!(view.revision("a").unwrap().seq, 3);
        assert_eq!(view.entry_count(), 3);
        assert!(view.is_empty());
    }

    #[test]
    fn test_replay_is_deterministic() {
        let log = OperationLog::new([1u8; 16]);
        for i in 0..10 {
            log.append(Operation::Put, format!("d{}", i % 3), Some(doc("i", &i.to_string())))
                .unwrap();
        }
        let v1 = Projector::materialize_log(&log).unwrap();
        let v2 = Projector::materialize_log(&log).unwrap();
        assert_eq!(v1, v2);
    }

    #[test]
    fn test_concurrent_conflict_resolves_by_total_order() {
        let a = OperationLog::new([1u8; 16]);
        let b = OperationLog::new([2u8; 16]);
        a.append(Operation::Put, "x", Some(doc("from", "a"))).unwrap();
        b.append(Operation::Put, "x", Some(doc("from", "b"))).unwrap();

        // same clock, replica [2;16] sorts later and wins on both sides
        let ab = Projector::materialize_log(&Merger::join(&a, &b).unwrap()).unwrap();
        let ba = Projector::materialize_log(&Merger::join(&b, &a).unwrap()).unwrap();
        assert_eq!(ab.get("x").unwrap().get("from").unwrap().as_str(), Some("b"));
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_revision_identical_across_replicas() {
        let a = OperationLog::new([1u8; 16]);
        a.append(Operation::Put, "x", Some(doc("k", "v"))).unwrap();
        let b = OperationLog::new([2u8; 16]);
        b.join(&a).unwrap();
        let va = Projector::materialize_log(&a).unwrap();
        let vb = Projector::materialize_log(&b).unwrap();
        assert_eq!(va.revision("x"), vb.revision("x"));
        assert_eq!(va.get("x").unwrap().rev(), vb.get("x").unwrap().rev());
    }

    #[test]
    fn test_replay_aborts_on_corrupt_entry() {
        let mut entry = LogEntry::new(
            1,
            [1u8; 16],
            BTreeSet::new(),
            Operation::Put,
            "x".into(),
            Some(doc("k", "v")),
        );
        entry.payload = Some(doc("k", "tampered"));
        let snapshot = LogSnapshot::new(vec![Arc::new(entry)], BTreeSet::new(), 1);
        let err = Projector::materialize(&snapshot).unwrap_err();
        assert!(matches!(err, CubeError::Validation(_)));
    }

    #[test]
    fn test_revision_parse_display() {
        let rev: Revision = "3-0123456789abcdef".parse().unwrap();
        assert_eq!(rev.seq, 3);
        assert_eq!(rev.to_string(), "3-0123456789abcdef");
        assert!("nodash".parse::<Revision>().is_err());
        assert!("x-abc".parse::<Revision>().is_err());
    }
}
