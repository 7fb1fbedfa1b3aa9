//! Convergence properties of join and replay
//!
//! Replicas that have seen the same set of entries must replay to the same
//! documents and revisions, whatever order they merged in.

use std::sync::Arc;

use libcubesat_core::{
    CubeError, Document, MemoryObjectStore, Merger, Operation, OperationLog, Projector,
    SnapshotManager,
};

fn doc(key: &str, value: &str) -> Document {
    Document::new().with(key, value)
}

/// Three replicas with overlapping, concurrent writes
fn three_replicas() -> (OperationLog, OperationLog, OperationLog) {
    let a = OperationLog::new([1u8; 16]);
    let b = OperationLog::new([2u8; 16]);
    let c = OperationLog::new([3u8; 16]);

    a.append(Operation::Put, "shared", Some(doc("from", "a"))).unwrap();
    a.append(Operation::Put, "a-only", Some(doc("k", "1"))).unwrap();

    b.append(Operation::Put, "shared", Some(doc("from", "b"))).unwrap();
    b.join(&a).unwrap();
    b.append(Operation::Del, "a-only", None).unwrap();

    c.append(Operation::Put, "shared", Some(doc("from", "c"))).unwrap();
    c.append(Operation::Put, "c-only", Some(doc("k", "3"))).unwrap();
    c.append(Operation::Put, "c-only", Some(doc("k", "4"))).unwrap();

    (a, b, c)
}

#[test]
fn test_join_is_commutative() {
    let (a, b, _) = three_replicas();
    let ab = Merger::join(&a, &b).unwrap();
    let ba = Merger::join(&b, &a).unwrap();

    assert_eq!(ab.snapshot().unwrap().hashes(), ba.snapshot().unwrap().hashes());
    assert_eq!(
        Projector::materialize_log(&ab).unwrap(),
        Projector::materialize_log(&ba).unwrap()
    );
}

#[test]
fn test_join_is_idempotent() {
    let (a, b, _) = three_replicas();
    let ab = Merger::join(&a, &b).unwrap();
    let before = ab.snapshot().unwrap().hashes();

    let stats = ab.join(&b).unwrap();
    assert_eq!(stats.entries_added, 0);
    assert_eq!(ab.snapshot().unwrap().hashes(), before);

    let again = Merger::join(&ab, &ab).unwrap();
    assert_eq!(again.snapshot().unwrap().hashes(), before);
}

#[test]
fn test_join_is_associative() {
    let (a, b, c) = three_replicas();
    let left = Merger::join(&Merger::join(&a, &b).unwrap(), &c).unwrap();
    let right = Merger::join(&a, &Merger::join(&b, &c).unwrap()).unwrap();

    assert_eq!(
        Projector::materialize_log(&left).unwrap(),
        Projector::materialize_log(&right).unwrap()
    );
}

#[test]
fn test_join_leaves_inputs_untouched() {
    let (a, b, _) = three_replicas();
    let (size_a, size_b) = (a.size(), b.size());
    let _ = Merger::join(&a, &b).unwrap();
    assert_eq!(a.size(), size_a);
    assert_eq!(b.size(), size_b);
}

#[test]
fn test_tombstone_does_not_erase_history() {
    let log = OperationLog::new([1u8; 16]);
    let put = log.append(Operation::Put, "x", Some(doc("k", "v"))).unwrap();
    log.append(Operation::Del, "x", None).unwrap();

    assert_eq!(log.size(), 2);
    assert!(log.get(&put.hash).is_ok());
    let view = Projector::materialize_log(&log).unwrap();
    assert!(view.get("x").is_none());
    assert_eq!(view.revision("x").unwrap().seq, 2);
}

#[test]
fn test_round_trip_through_fresh_store() {
    let (a, b, c) = three_replicas();
    let merged = Merger::join(&Merger::join(&a, &b).unwrap(), &c).unwrap();

    let store = Arc::new(MemoryObjectStore::new());
    let manager = SnapshotManager::new(store.as_ref());
    let id = manager.to_content_id(&merged).unwrap();

    let restored = manager.load_from(&id, [9u8; 16], store.clone()).unwrap();
    assert_eq!(restored.size(), merged.size());
    assert_eq!(
        Projector::materialize_log(&restored).unwrap(),
        Projector::materialize_log(&merged).unwrap()
    );
    assert_eq!(manager.to_content_id(&restored).unwrap(), id);
}

#[test]
fn test_empty_log_has_no_content_id() {
    let store = MemoryObjectStore::new();
    let log = OperationLog::new([1u8; 16]);
    assert!(matches!(
        SnapshotManager::new(&store).to_content_id(&log),
        Err(CubeError::NotReady(_))
    ));
}

#[test]
fn test_failed_load_leaves_log_intact() {
    let source_store = Arc::new(MemoryObjectStore::new());
    let source = OperationLog::with_store([1u8; 16], source_store.clone());
    let root = source.append(Operation::Put, "a", Some(doc("k", "1"))).unwrap();
    source.append(Operation::Put, "b", Some(doc("k", "2"))).unwrap();
    let id = SnapshotManager::new(source_store.as_ref())
        .to_content_id(&source)
        .unwrap();
    source_store.remove(&root.hash);

    let target = OperationLog::with_store([2u8; 16], source_store.clone());
    target.append(Operation::Put, "mine", Some(doc("k", "0"))).unwrap();
    let (size, heads, clock) = (target.size(), target.heads(), target.clock());

    let err = SnapshotManager::new(source_store.as_ref())
        .load_into(&target, &id)
        .unwrap_err();
    assert!(matches!(err, CubeError::Fetch { hash } if hash == root.hash));
    assert_eq!(target.size(), size);
    assert_eq!(target.heads(), heads);
    assert_eq!(target.clock(), clock);
}

#[test]
fn test_join_resolves_ancestors_through_shared_store() {
    let store = Arc::new(MemoryObjectStore::new());
    let a = OperationLog::with_store([1u8; 16], store.clone());
    a.append(Operation::Put, "x", Some(doc("k", "1"))).unwrap();
    a.append(Operation::Put, "x", Some(doc("k", "2"))).unwrap();

    // b only knows a's head, published through the store
    let id = SnapshotManager::new(store.as_ref()).to_content_id(&a).unwrap();
    let b = OperationLog::with_store([2u8; 16], store.clone());
    let stats = SnapshotManager::new(store.as_ref()).load_into(&b, &id).unwrap();

    assert_eq!(stats.entries_added, 2);
    assert_eq!(b.heads(), a.heads());
}
