//! Join of two logs and the deterministic linearization used for replay
//!
//! The merged entry set is the hash-deduplicated union of both logs, and the
//! edges are the union of parent links. Replay order is a topological sort
//! of that DAG where, among entries unordered by ancestry, the smallest
//! `(clock, replica_id, hash)` goes first. Because the order depends only on
//! the entry set, join is commutative, associative and idempotent.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::codec::decode_entry;
use crate::error::CubeError;
use crate::log::{LogState, OperationLog};
use crate::object_store::ContentAddressedStore;
use crate::types::entry::LogEntry;
use crate::types::ids::{short_hash, EntryHash, ReplicaId};

/// Entries to add to a log, resolved but not yet applied
#[derive(Debug, Default)]
pub struct MergePlan {
    pub new_entries: Vec<Arc<LogEntry>>,
    /// How many of `new_entries` came from the object store
    pub fetched: usize,
}

/// Resolves and combines entry sets
pub struct Merger<'a> {
    store: Option<&'a dyn ContentAddressedStore>,
    fetch_limit: Option<usize>,
}

impl<'a> Merger<'a> {
    pub fn new(store: Option<&'a dyn ContentAddressedStore>, fetch_limit: Option<usize>) -> Self {
        Self { store, fetch_limit }
    }

    /// Join two logs into a new one owned by `a`'s replica
    ///
    /// Neither input is modified. The result shares `a`'s store.
    pub fn join(a: &OperationLog, b: &OperationLog) -> Result<OperationLog, CubeError> {
        let mut state = a.state_clone()?;
        let incoming: Vec<Arc<LogEntry>> = b.state_clone()?.entries.into_values().collect();

        let plan = Merger::new(a.store().map(|s| s.as_ref()), a.fetch_limit())
            .plan(&state.entries, incoming)?;
        apply_plan(&mut state, plan);

        Ok(OperationLog::from_state(
            *a.replica_id(),
            a.store().cloned(),
            a.fetch_limit(),
            state,
        ))
    }

    /// Work out which entries `incoming` adds to `base`, fetching missing ancestors
    ///
    /// Every parent referenced by a new entry must end up in `base`, in
    /// `incoming`, or be fetched here. A hash that cannot be fetched fails the
    /// whole plan with [`CubeError::Fetch`].
    pub fn plan(
        &self,
        base: &HashMap<EntryHash, Arc<LogEntry>>,
        incoming: Vec<Arc<LogEntry>>,
    ) -> Result<MergePlan, CubeError> {
        let mut resolved: HashMap<EntryHash, Arc<LogEntry>> = HashMap::new();
        for entry in incoming {
            if !base.contains_key(&entry.hash) {
                resolved.insert(entry.hash, entry);
            }
        }

        let mut queue: VecDeque<EntryHash> = resolved
            .values()
            .flat_map(|e| e.parents.iter().copied())
            .collect();
        let mut attempted: HashSet<EntryHash> = HashSet::new();
        let mut fetched = 0usize;

        while let Some(hash) = queue.pop_front() {
            if base.contains_key(&hash) || resolved.contains_key(&hash) {
                continue;
            }
            if !attempted.insert(hash) {
                continue;
            }
            if let Some(limit) = self.fetch_limit {
                if fetched >= limit {
                    warn!(hash = %short_hash(&hash), limit, "fetch limit reached");
                    return Err(CubeError::Fetch { hash });
                }
            }

            let entry = self.fetch(&hash)?;
            fetched += 1;
            queue.extend(entry.parents.iter().copied());
            resolved.insert(hash, Arc::new(entry));
        }

        let mut new_entries: Vec<Arc<LogEntry>> = resolved.into_values().collect();
        new_entries.sort_by(|a, b| a.order_key().cmp(&b.order_key()));

        debug!(new = new_entries.len(), fetched, "merge plan resolved");
        Ok(MergePlan {
            new_entries,
            fetched,
        })
    }

    /// Single attempt to resolve one entry through the store
    fn fetch(&self, hash: &EntryHash) -> Result<LogEntry, CubeError> {
        let store = self.store.ok_or(CubeError::Fetch { hash: *hash })?;
        let bytes = match store.get(hash) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!(hash = %short_hash(hash), "ancestor missing from store");
                return Err(CubeError::Fetch { hash: *hash });
            }
            Err(e) => {
                warn!(hash = %short_hash(hash), error = %e, "store lookup failed");
                return Err(CubeError::Fetch { hash: *hash });
            }
        };
        let entry = decode_entry(&bytes)?;
        if entry.hash != *hash {
            return Err(CubeError::Validation(format!(
                "store returned {} for {}",
                short_hash(&entry.hash),
                short_hash(hash)
            )));
        }
        Ok(entry)
    }
}

pub(crate) fn apply_plan(state: &mut LogState, plan: MergePlan) {
    let mut added = false;
    for entry in plan.new_entries {
        state.clock = state.clock.max(entry.clock);
        if !state.entries.contains_key(&entry.hash) {
            state.entries.insert(entry.hash, entry);
            added = true;
        }
    }
    if added {
        state.heads = compute_heads(&state.entries);
    }
}

/// Entries that no other entry in the set names as a parent
pub fn compute_heads(entries: &HashMap<EntryHash, Arc<LogEntry>>) -> BTreeSet<EntryHash> {
    let referenced: HashSet<&EntryHash> = entries.values().flat_map(|e| e.parents.iter()).collect();
    entries
        .keys()
        .filter(|h| !referenced.contains(h))
        .copied()
        .collect()
}

/// Deterministic total order of a DAG of entries
///
/// Kahn's algorithm with a min-heap on `(clock, replica_id, hash)` over the
/// set of entries whose present parents have all been emitted. Parents
/// absent from `entries` are treated as already satisfied.
pub fn total_order(entries: &HashMap<EntryHash, Arc<LogEntry>>) -> Vec<Arc<LogEntry>> {
    let mut pending: HashMap<EntryHash, usize> = HashMap::with_capacity(entries.len());
    let mut children: HashMap<EntryHash, Vec<EntryHash>> = HashMap::new();

    for entry in entries.values() {
        let mut waiting = 0;
        for parent in &entry.parents {
            if entries.contains_key(parent) {
                waiting += 1;
                children.entry(*parent).or_default().push(entry.hash);
            }
        }
        pending.insert(entry.hash, waiting);
    }

    let mut ready: BinaryHeap<Reverse<(u64, ReplicaId, EntryHash)>> = entries
        .values()
        .filter(|e| pending.get(&e.hash) == Some(&0))
        .map(|e| Reverse((e.clock, e.replica_id, e.hash)))
        .collect();

    let mut ordered = Vec::with_capacity(entries.len());
    while let Some(Reverse((_, _, hash))) = ready.pop() {
        let Some(entry) = entries.get(&hash) else {
            continue;
        };
        ordered.push(entry.clone());

        for child in children.get(&hash).into_iter().flatten() {
            if let Some(waiting) = pending.get_mut(child) {
                *waiting -= 1;
                if *waiting == 0 {
                    if let Some(c) = entries.get(child) {
                        ready.push(Reverse((c.clock, c.replica_id, c.hash)));
                    }
                }
            }
        }
    }

    debug_assert_eq!(ordered.len(), entries.len(), "entry graph contains a cycle");
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_entry;
    use crate::object_store::MemoryObjectStore;
    use crate::types::entry::Operation;
    use crate::types::value::Document;

    fn entry(clock: u64, replica: u8, parents: &[EntryHash], doc: &str) -> Arc<LogEntry> {
        Arc::new(LogEntry::new(
            clock,
            [replica; 16],
            parents.iter().copied().collect(),
            Operation::Put,
            doc.to_string(),
            Some(Document::new()),
        ))
    }

    fn index(entries: &[Arc<LogEntry>]) -> HashMap<EntryHash, Arc<LogEntry>> {
        entries.iter().map(|e| (e.hash, e.clone())).collect()
    }

    #[test]
    fn test_total_order_respects_ancestry_over_clock() {
        // child has a lower clock than an unrelated root but must follow its parent
        let root = entry(5, 1, &[], "a");
        let child = entry(6, 1, &[root.hash], "a");
        let other = entry(1, 2, &[], "b");
        let order = total_order(&index(&[child.clone(), other.clone(), root.clone()]));
        let hashes: Vec<_> = order.iter().map(|e| e.hash).collect();
        assert_eq!(hashes, vec![other.hash, root.hash, child.hash]);
    }

    #[test]
    fn test_total_order_tiebreak_replica_then_hash() {
        let a = entry(1, 2, &[], "x");
        let b = entry(1, 1, &[], "x");
        let order = total_order(&index(&[a.clone(), b.clone()]));
        assert_eq!(order[0].hash, b.hash);
        assert_eq!(order[1].hash, a.hash);

        let c = entry(1, 1, &[], "y");
        let order = total_order(&index(&[b.clone(), c.clone()]));
        let (lo, hi) = if b.hash < c.hash { (b, c) } else { (c, b) };
        assert_eq!(order[0].hash, lo.hash);
        assert_eq!(order[1].hash, hi.hash);
    }

    #[test]
    fn test_total_order_independent_of_insertion() {
        let r1 = entry(1, 1, &[], "a");
        let r2 = entry(1, 2, &[], "b");
        let m = entry(2, 1, &[r1.hash, r2.hash], "c");
        let o1 = total_order(&index(&[r1.clone(), r2.clone(), m.clone()]));
        let o2 = total_order(&index(&[m, r2, r1]));
        let h1: Vec<_> = o1.iter().map(|e| e.hash).collect();
        let h2: Vec<_> = o2.iter().map(|e| e.hash).collect();
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_compute_heads() {
        let r1 = entry(1, 1, &[], "a");
        let r2 = entry(1, 2, &[], "b");
        let c = entry(2, 1, &[r1.hash], "a");
        let heads = compute_heads(&index(&[r1, r2.clone(), c.clone()]));
        assert_eq!(heads, BTreeSet::from([r2.hash, c.hash]));
    }

    #[test]
    fn test_plan_fetches_missing_ancestors() {
        let store = MemoryObjectStore::new();
        let root = entry(1, 1, &[], "a");
        let child = entry(2, 1, &[root.hash], "a");
        store.put(&encode_entry(&root)).unwrap();

        let plan = Merger::new(Some(&store), None)
            .plan(&HashMap::new(), vec![child.clone()])
            .unwrap();
        assert_eq!(plan.fetched, 1);
        assert_eq!(plan.new_entries.len(), 2);
    }

    #[test]
    fn test_plan_fails_on_unresolvable_ancestor() {
        let store = MemoryObjectStore::new();
        let root = entry(1, 1, &[], "a");
        let child = entry(2, 1, &[root.hash], "a");

        let err = Merger::new(Some(&store), None)
            .plan(&HashMap::new(), vec![child])
            .unwrap_err();
        match err {
            CubeError::Fetch { hash } => assert_eq!(hash, root.hash),
            other => panic!("Expected Fetch error, got {:?}", other),
        }
    }

    #[test]
    fn test_plan_respects_fetch_limit() {
        let store = MemoryObjectStore::new();
        let e1 = entry(1, 1, &[], "a");
        let e2 = entry(2, 1, &[e1.hash], "a");
        let e3 = entry(3, 1, &[e2.hash], "a");
        store.put(&encode_entry(&e1)).unwrap();
        store.put(&encode_entry(&e2)).unwrap();

        let result = Merger::new(Some(&store), Some(1)).plan(&HashMap::new(), vec![e3]);
        assert!(matches!(result, Err(CubeError::Fetch { hash }) if hash == e1.hash));
    }

    #[test]
    fn test_plan_skips_known_entries() {
        let root = entry(1, 1, &[], "a");
        let base = index(&[root.clone()]);
        let plan = Merger::new(None, None).plan(&base, vec![root]).unwrap();
        assert!(plan.new_entries.is_empty());
    }
}
