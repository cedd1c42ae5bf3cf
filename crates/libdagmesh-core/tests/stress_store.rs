//! Stress tests for concurrent store access
//!
//! Writers race on the same document through the compare-and-swap path and
//! must end up with one linear history in which every write is counted once.

use std::collections::BTreeMap;
use std::sync::{Arc, Barrier};
use std::thread;

use libdagmesh_core::hash::canonical_fields;
use libdagmesh_core::types::ids::derive_doc_id;
use libdagmesh_core::{
    AllowAll, Assembler, Commit, CommitStore, CompositeCommit, CrdtKind, DocId, DocStatus,
    FieldCommit, FieldDelta, FieldLink, FieldPayload, Keyring, MeshError, Value,
};
use tempfile::tempdir;

fn points_commit(doc_id: DocId, value: i64, nonce: u64, priority: u64) -> Commit {
    Commit::Field(FieldCommit {
        doc_id,
        field: "points".to_string(),
        crdt: CrdtKind::PnCounter,
        priority,
        payload: FieldPayload::Plain(FieldDelta::Counter {
            value: Value::Int(value),
            nonce,
        }),
    })
}

/// Build and commit one increment on top of the current heads
fn increment(store: &CommitStore, doc_id: DocId, nonce: u64) -> Result<(), MeshError> {
    let heads = store.heads(&doc_id)?;
    let mut priority = 0;
    for head in &heads {
        priority = priority.max(store.get(head)?.priority());
    }
    priority += 1;

    let field = points_commit(doc_id, 1, nonce, priority);
    let composite = Commit::Composite(CompositeCommit::new(
        doc_id,
        "Users",
        priority,
        heads.clone(),
        vec![FieldLink {
            name: "points".to_string(),
            cid: field.cid(),
        }],
        DocStatus::Active,
    ));
    store.commit_local(&doc_id, &heads, &[field, composite])?;
    Ok(())
}

fn doc_for(index: u64) -> DocId {
    let mut fields = BTreeMap::new();
    fields.insert("index".to_string(), Value::Int(index as i64));
    derive_doc_id("Users", &canonical_fields(&fields))
}

#[test]
fn test_concurrent_document_creation() {
    let dir = tempdir().unwrap();
    let store = Arc::new(CommitStore::open(dir.path()).expect("Failed to open store"));

    let num_threads = 8;
    let docs_per_thread = 25;
    let barrier = Arc::new(Barrier::new(num_threads));

    let handles: Vec<_> = (0..num_threads)
        .map(|thread_id| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);

            thread::spawn(move || {
                barrier.wait();

                let mut success_count = 0;
                for i in 0..docs_per_thread {
                    let doc_id = doc_for((thread_id * docs_per_thread + i) as u64);
                    match increment(&store, doc_id, 0) {
                        Ok(()) => success_count += 1,
                        Err(e) => eprintln!("Thread {} doc {} failed: {:?}", thread_id, i, e),
                    }
                }
                success_count
            })
        })
        .collect();

    let total_success: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    let expected = num_threads * docs_per_thread;
    assert_eq!(total_success, expected);

    let stats = store.stats(Some(dir.path())).expect("Failed to get stats");
    assert_eq!(stats.document_count, expected);
    assert_eq!(stats.commit_count, expected * 2);
    assert_eq!(store.documents("Users").unwrap().len(), expected);
}

#[test]
fn test_concurrent_writes_single_document() {
    let dir = tempdir().unwrap();
    let store = Arc::new(CommitStore::open(dir.path()).expect("Failed to open store"));
    let doc_id = doc_for(0);
    increment(&store, doc_id, 0).expect("Failed to create document");

    let num_threads = 8;
    let writes_per_thread = 20;
    let barrier = Arc::new(Barrier::new(num_threads));

    let handles: Vec<_> = (0..num_threads)
        .map(|thread_id| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);

            thread::spawn(move || {
                barrier.wait();

                let mut conflicts = 0;
                for i in 0..writes_per_thread {
                    let nonce = (thread_id * writes_per_thread + i + 1) as u64;
                    loop {
                        match increment(&store, doc_id, nonce) {
                            Ok(()) => break,
                            Err(MeshError::TransactionConflict(_)) => conflicts += 1,
                            Err(e) => panic!("unexpected error: {:?}", e),
                        }
                    }
                }
                conflicts
            })
        })
        .collect();

    let conflicts: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    let expected = num_threads * writes_per_thread + 1;

    // every write extended the full head set, so history is a single chain
    assert_eq!(store.heads(&doc_id).unwrap().len(), 1);
    assert_eq!(store.history(&doc_id).unwrap().len(), expected);

    let keys = Keyring::generate();
    let doc = Assembler::new(&store, &keys, &AllowAll)
        .materialize(&doc_id)
        .unwrap();
    assert_eq!(doc.get("points"), Some(&Value::Int(expected as i64)));

    println!("Concurrent writes: {} writes, {} conflicts retried", expected, conflicts);
}

#[test]
fn test_concurrent_read_write() {
    let dir = tempdir().unwrap();
    let store = Arc::new(CommitStore::open(dir.path()).expect("Failed to open store"));
    let doc_id = doc_for(0);
    increment(&store, doc_id, 0).expect("Failed to create document");

    let num_readers = 4;
    let num_writers = 4;
    let ops_per_thread = 50;
    let barrier = Arc::new(Barrier::new(num_readers + num_writers));

    let reader_handles: Vec<_> = (0..num_readers)
        .map(|_| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);

            thread::spawn(move || {
                let keys = Keyring::generate();
                barrier.wait();

                let mut read_count = 0;
                for _ in 0..ops_per_thread {
                    if Assembler::new(&store, &keys, &AllowAll)
                        .materialize(&doc_id)
                        .is_ok()
                    {
                        read_count += 1;
                    }
                }
                read_count
            })
        })
        .collect();

    let writer_handles: Vec<_> = (0..num_writers)
        .map(|thread_id| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);

            thread::spawn(move || {
                barrier.wait();

                let mut write_count = 0;
                for i in 0..ops_per_thread {
                    let nonce = (thread_id * ops_per_thread + i + 1) as u64;
                    while let Err(e) = increment(&store, doc_id, nonce) {
                        assert!(e.is_retryable(), "unexpected error: {:?}", e);
                    }
                    write_count += 1;
                }
                write_count
            })
        })
        .collect();

    let total_reads: usize = reader_handles.into_iter().map(|h| h.join().unwrap()).sum();
    let total_writes: usize = writer_handles.into_iter().map(|h| h.join().unwrap()).sum();

    // a snapshot read never observes a half-written version
    assert_eq!(total_reads, num_readers * ops_per_thread, "Some reads failed");
    assert_eq!(total_writes, num_writers * ops_per_thread, "Some writes failed");
}
