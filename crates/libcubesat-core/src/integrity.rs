//! Integrity checking for log entries
//!
//! Provides verification of entry hashes, entry shape, and ancestry closure.

use std::collections::HashSet;

use crate::hash::compute_entry_hash;
use crate::log::LogSnapshot;
use crate::types::entry::{LogEntry, Operation};
use crate::types::ids::{short_hash, EntryHash};

/// Result of an integrity check
#[derive(Debug, Default)]
pub struct IntegrityReport {
    /// Total entries checked
    pub entries_checked: usize,
    /// Entries that passed all checks
    pub entries_valid: usize,
    /// Entries with corruption issues
    pub corrupt_entries: Vec<CorruptEntry>,
}

/// A corrupt entry with details
#[derive(Debug)]
pub struct CorruptEntry {
    pub hash: EntryHash,
    pub doc_id: String,
    pub kind: CorruptionKind,
}

/// Types of entry corruption
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorruptionKind {
    /// Stored hash doesn't match the recomputed hash
    HashMismatch {
        expected: EntryHash,
        computed: EntryHash,
    },
    /// Entry references a parent that isn't in the log
    MissingParent { parent: EntryHash },
    /// Operation and payload disagree, or the doc id is empty
    MalformedOperation { reason: String },
}

impl std::fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CorruptionKind::HashMismatch { expected, computed } => write!(
                f,
                "hash mismatch: stored {} computed {}",
                short_hash(expected),
                short_hash(computed)
            ),
            CorruptionKind::MissingParent { parent } => {
                write!(f, "missing parent {}", short_hash(parent))
            }
            CorruptionKind::MalformedOperation { reason } => write!(f, "malformed: {}", reason),
        }
    }
}

impl IntegrityReport {
    /// Check if the report indicates all is well
    pub fn is_healthy(&self) -> bool {
        self.corrupt_entries.is_empty()
    }

    /// Get the number of corrupt entries
    pub fn corruption_count(&self) -> usize {
        self.corrupt_entries.len()
    }
}

/// Verify that an entry's hash matches its content
pub fn verify_entry_hash(entry: &LogEntry) -> Result<(), CorruptionKind> {
    let computed = compute_entry_hash(
        entry.clock,
        &entry.replica_id,
        &entry.parents,
        entry.operation,
        &entry.doc_id,
        entry.payload.as_ref(),
    );

    if computed != entry.hash {
        return Err(CorruptionKind::HashMismatch {
            expected: entry.hash,
            computed,
        });
    }

    Ok(())
}

/// Verify the entry's shape: PUT carries a payload, DEL doesn't, doc id is set
pub fn verify_entry_shape(entry: &LogEntry) -> Result<(), CorruptionKind> {
    if entry.doc_id.is_empty() {
        return Err(CorruptionKind::MalformedOperation {
            reason: "empty document id".to_string(),
        });
    }
    match (entry.operation, &entry.payload) {
        (Operation::Put, None) => Err(CorruptionKind::MalformedOperation {
            reason: "PUT without payload".to_string(),
        }),
        (Operation::Del, Some(_)) => Err(CorruptionKind::MalformedOperation {
            reason: "DEL with payload".to_string(),
        }),
        _ => Ok(()),
    }
}

/// Check shape and hash of one entry
pub fn verify_entry(entry: &LogEntry) -> Result<(), CorruptionKind> {
    verify_entry_shape(entry)?;
    verify_entry_hash(entry)
}

/// Check integrity of every entry in a snapshot
///
/// This verifies:
/// - Entry shape and hashes
/// - Parent references point to entries in the snapshot (optional)
pub fn check_log_integrity(snapshot: &LogSnapshot, verify_parents: bool) -> IntegrityReport {
    let mut report = IntegrityReport::default();
    let known: HashSet<EntryHash> = snapshot.entries().iter().map(|e| e.hash).collect();

    for entry in snapshot.entries() {
        report.entries_checked += 1;

        if let Err(kind) = verify_entry(entry) {
            report.corrupt_entries.push(CorruptEntry {
                hash: entry.hash,
                doc_id: entry.doc_id.clone(),
                kind,
            });
            continue;
        }

        if verify_parents {
            if let Some(parent) = entry.parents.iter().find(|p| !known.contains(*p)) {
                report.corrupt_entries.push(CorruptEntry {
                    hash: entry.hash,
                    doc_id: entry.doc_id.clone(),
                    kind: CorruptionKind::MissingParent { parent: *parent },
                });
                continue;
            }
        }

        report.entries_valid += 1;
    }

    report
}
