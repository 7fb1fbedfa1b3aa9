//! Stress tests for replica directory locking
//!
//! These tests verify that a replica directory is only ever opened by one
//! handle, and that a single open replica handles concurrent writers.

use libcubesat_core::{AllDocsOptions, Document};
use libcubesat_store::{LockedReplica, StoreError};
use std::sync::{atomic::{AtomicUsize, Ordering}, Arc, Barrier};
use std::thread;
use tempfile::tempdir;

#[test]
fn test_concurrent_open_while_locked() {
    let dir = tempdir().unwrap();
    let path = Arc::new(dir.path().to_path_buf());
    let holder = LockedReplica::open(&path, "cube").expect("Failed to open replica");

    let num_threads = 8;
    let barrier = Arc::new(Barrier::new(num_threads));
    let busy_counter = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let path = Arc::clone(&path);
            let barrier = Arc::clone(&barrier);
            let busy_counter = Arc::clone(&busy_counter);

            thread::spawn(move || {
                barrier.wait();
                match LockedReplica::open(&path, "cube") {
                    Err(StoreError::DbBusy(_)) => {
                        busy_counter.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => panic!("Expected DbBusy, got {:?}", e),
                    Ok(_) => panic!("Opened a replica that is already locked"),
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(busy_counter.load(Ordering::SeqCst), num_threads);

    drop(holder);
    let _reopened = LockedReplica::open(&path, "cube").expect("Lock should be released");
}

#[test]
fn test_concurrent_writers_on_one_handle() {
    let dir = tempdir().unwrap();
    let replica = Arc::new(LockedReplica::open(dir.path(), "cube").expect("Failed to open replica"));

    let num_threads = 4;
    let posts_per_thread = 25;
    let barrier = Arc::new(Barrier::new(num_threads * 2));

    let writers: Vec<_> = (0..num_threads)
        .map(|thread_id| {
            let replica = Arc::clone(&replica);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..posts_per_thread {
                    let doc = Document::new()
                        .with("thread", thread_id as i64)
                        .with("i", i as i64);
                    replica.post(doc).expect("post failed");
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..num_threads)
        .map(|_| {
            let replica = Arc::clone(&replica);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..10 {
                    let rows = replica
                        .all(&AllDocsOptions::default().without_docs())
                        .expect("listing failed");
                    assert!(rows.len() <= num_threads * posts_per_thread);
                }
            })
        })
        .collect();

    for h in writers.into_iter().chain(readers) {
        h.join().unwrap();
    }

    let expected = num_threads * posts_per_thread;
    assert_eq!(replica.log().size(), expected);
    assert_eq!(replica.documents().unwrap().len(), expected);

    replica.checkpoint().expect("checkpoint failed");
    drop(replica);

    let reopened = LockedReplica::open(dir.path(), "cube").expect("Failed to reopen replica");
    assert_eq!(reopened.log().size(), expected);
    assert_eq!(reopened.documents().unwrap().len(), expected);
}
