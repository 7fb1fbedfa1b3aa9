use std::collections::BTreeSet;
use serde::{Deserialize, Serialize};

use super::ids::{DocId, EntryHash, ReplicaId};
use super::value::Document;
use crate::hash::compute_entry_hash;

/// The operation recorded by a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    /// Full document write; carries the payload
    Put,
    /// Tombstone; carries no payload
    Del,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Put => "PUT",
            Operation::Del => "DEL",
        }
    }

    /// Tag used in the canonical CBOR encoding
    pub fn tag(&self) -> u32 {
        match self {
            Operation::Put => 1,
            Operation::Del => 2,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(Operation::Put),
            2 => Some(Operation::Del),
            _ => None,
        }
    }
}

/// An immutable, content-addressed record of one logged operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// BLAKE2b-256 over the canonical encoding of every other field
    pub hash: EntryHash,
    /// Lamport clock of the authoring replica
    pub clock: u64,
    /// Replica that authored this entry
    pub replica_id: ReplicaId,
    /// Immediate predecessors (the head set at append time)
    pub parents: BTreeSet<EntryHash>,
    pub operation: Operation,
    pub doc_id: DocId,
    /// Document body for `Put`, `None` for `Del`
    pub payload: Option<Document>,
}

impl LogEntry {
    /// Create an entry, computing its content hash
    pub fn new(
        clock: u64,
        replica_id: ReplicaId,
        parents: BTreeSet<EntryHash>,
        operation: Operation,
        doc_id: DocId,
        payload: Option<Document>,
    ) -> Self {
        let hash = compute_entry_hash(
            clock,
            &replica_id,
            &parents,
            operation,
            &doc_id,
            payload.as_ref(),
        );
        Self {
            hash,
            clock,
            replica_id,
            parents,
            operation,
            doc_id,
            payload,
        }
    }

    /// Tie-break key for entries unordered by ancestry: (clock, replica, hash)
    pub fn order_key(&self) -> (u64, &ReplicaId, &EntryHash) {
        (self.clock, &self.replica_id, &self.hash)
    }

    pub fn is_tombstone(&self) -> bool {
        self.operation == Operation::Del
    }
}
