//! Binding and transaction semantics, including the canonical scenarios:
//! symmetric list bindings, reference stealing, ERROR/CASCADE deletes, and
//! concurrent-modification behavior with and without the retry wrapper.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::*;
use topograph::{
    Backend, ChangeKind, MemoryBackend, ObjId, Owner, PathLayout, PersistOp, StoreConfig,
    StoreError, Transaction,
};

#[tokio::test]
async fn symmetric_list_binding_materializes_backreference() {
    let store = fresh_store().await;
    let mut tx = store.transaction(Owner::named("setup")).await.unwrap();
    tx.create(&bridge("b1")).await.unwrap();
    tx.create(&port("p1", Some("b1"))).await.unwrap();
    tx.commit().await.unwrap();

    let b1: Bridge = store.get(&ObjId::new("b1")).await.unwrap();
    assert_eq!(b1.port_ids, vec!["p1".to_string()]);
    let p1: Port = store.get(&ObjId::new("p1")).await.unwrap();
    assert_eq!(p1.bridge_id.as_deref(), Some("b1"));
}

#[tokio::test]
async fn reference_stealing_is_rejected() {
    let store = fresh_store().await;
    let mut tx = store.transaction(Owner::named("setup")).await.unwrap();
    tx.create(&bridge("b1")).await.unwrap();
    tx.create(&port("p1", Some("b1"))).await.unwrap();
    tx.commit().await.unwrap();

    // B2 claims P1, but P1's single reference already points at B1.
    let mut tx = store.transaction(Owner::named("thief")).await.unwrap();
    let mut b2 = bridge("b2");
    b2.port_ids = vec!["p1".to_string()];
    let err = tx.create(&b2).await.unwrap_err();
    assert!(
        matches!(&err, StoreError::ReferenceConflict { class, id, field }
            if class == "Port" && id == "p1" && field == "bridge_id"),
        "unexpected error: {err}"
    );
    tx.close().await;
}

#[tokio::test]
async fn delete_with_error_action_is_blocked_while_referenced() {
    let store = fresh_store().await;
    let mut tx = store.transaction(Owner::named("setup")).await.unwrap();
    tx.create(&port("p1", None)).await.unwrap();
    tx.create(&router("r1", &["p1"])).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.transaction(Owner::named("cleanup")).await.unwrap();
    let err = tx.delete::<Router>(&ObjId::new("r1")).await.unwrap_err();
    assert!(
        matches!(&err, StoreError::ObjectReferenced { class, id, field }
            if class == "Router" && id == "r1" && field == "port_ids"),
        "unexpected error: {err}"
    );
    tx.close().await;

    // Detach the port, then the delete goes through.
    let mut tx = store.transaction(Owner::named("cleanup")).await.unwrap();
    let mut p1: Port = tx.get(&ObjId::new("p1")).await.unwrap();
    p1.router_id = None;
    tx.update(&p1).await.unwrap();
    tx.delete::<Router>(&ObjId::new("r1")).await.unwrap();
    tx.commit().await.unwrap();

    assert!(!store.exists::<Router>(&ObjId::new("r1")).await.unwrap());
    assert!(store.exists::<Port>(&ObjId::new("p1")).await.unwrap());
}

#[tokio::test]
async fn cascade_delete_removes_the_whole_subtree() {
    let store = fresh_store().await;
    let mut tx = store.transaction(Owner::named("setup")).await.unwrap();
    tx.create(&chain("c1", &[])).await.unwrap();
    tx.create(&rule("r1", Some("c1"))).await.unwrap();
    tx.create(&rule("r2", Some("c1"))).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.transaction(Owner::named("cleanup")).await.unwrap();
    tx.delete::<Chain>(&ObjId::new("c1")).await.unwrap();
    tx.commit().await.unwrap();

    for id in ["r1", "r2"] {
        let err = store.get::<Rule>(&ObjId::new(id)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }
    assert!(!store.exists::<Chain>(&ObjId::new("c1")).await.unwrap());
}

#[tokio::test]
async fn update_moves_references_between_peers() {
    let store = fresh_store().await;
    let mut tx = store.transaction(Owner::named("setup")).await.unwrap();
    tx.create(&bridge("b1")).await.unwrap();
    tx.create(&bridge("b2")).await.unwrap();
    tx.create(&port("p1", Some("b1"))).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.transaction(Owner::named("mover")).await.unwrap();
    let mut p1: Port = tx.get(&ObjId::new("p1")).await.unwrap();
    p1.bridge_id = Some("b2".to_string());
    tx.update(&p1).await.unwrap();
    tx.commit().await.unwrap();

    let b1: Bridge = store.get(&ObjId::new("b1")).await.unwrap();
    assert!(b1.port_ids.is_empty());
    let b2: Bridge = store.get(&ObjId::new("b2")).await.unwrap();
    assert_eq!(b2.port_ids, vec!["p1".to_string()]);
}

#[tokio::test]
async fn clear_action_detaches_peers_on_delete() {
    let store = fresh_store().await;
    let mut tx = store.transaction(Owner::named("setup")).await.unwrap();
    tx.create(&bridge("b1")).await.unwrap();
    tx.create(&port("p1", Some("b1"))).await.unwrap();
    tx.create(&port("p2", Some("b1"))).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.transaction(Owner::named("cleanup")).await.unwrap();
    tx.delete::<Bridge>(&ObjId::new("b1")).await.unwrap();
    tx.commit().await.unwrap();

    for id in ["p1", "p2"] {
        let p: Port = store.get(&ObjId::new(id)).await.unwrap();
        assert_eq!(p.bridge_id, None, "port {id} still references b1");
    }
}

#[tokio::test]
async fn duplicate_create_and_missing_lookups() {
    let store = fresh_store().await;
    let mut tx = store.transaction(Owner::named("setup")).await.unwrap();
    tx.create(&bridge("b1")).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.transaction(Owner::named("dup")).await.unwrap();
    let err = tx.create(&bridge("b1")).await.unwrap_err();
    assert!(matches!(err, StoreError::ObjectExists { .. }));
    tx.close().await;

    let mut tx = store.transaction(Owner::named("del")).await.unwrap();
    let err = tx.delete::<Bridge>(&ObjId::new("ghost")).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
    tx.close().await;

    let mut tx = store.transaction(Owner::named("del")).await.unwrap();
    assert!(!tx.delete_if_exists::<Bridge>(&ObjId::new("ghost")).await.unwrap());
    assert!(tx.delete_if_exists::<Bridge>(&ObjId::new("b1")).await.unwrap());
    tx.commit().await.unwrap();
    assert!(!store.exists::<Bridge>(&ObjId::new("b1")).await.unwrap());
}

#[tokio::test]
async fn update_validator_can_reject() {
    let store = fresh_store().await;
    let mut tx = store.transaction(Owner::named("setup")).await.unwrap();
    tx.create(&bridge("b1")).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.transaction(Owner::named("editor")).await.unwrap();
    let mut b1: Bridge = tx.get(&ObjId::new("b1")).await.unwrap();
    b1.name = "renamed".to_string();
    let err = tx
        .update_with(&b1, |old: &Bridge, new: &Bridge| {
            if old.name != new.name {
                Err(StoreError::internal("renames are not allowed here"))
            } else {
                Ok(())
            }
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InternalObjectMapper { .. }));
    tx.close().await;

    let after: Bridge = store.get(&ObjId::new("b1")).await.unwrap();
    assert_eq!(after.name, "bridge-b1");
}

#[tokio::test]
async fn create_then_delete_cancels_out() {
    let store = fresh_store().await;
    let mut tx = store.transaction(Owner::named("fickle")).await.unwrap();
    tx.create(&bridge("b1")).await.unwrap();
    tx.create(&bridge("b2")).await.unwrap();
    tx.delete::<Bridge>(&ObjId::new("b2")).await.unwrap();
    tx.commit().await.unwrap();

    assert!(store.exists::<Bridge>(&ObjId::new("b1")).await.unwrap());
    assert!(!store.exists::<Bridge>(&ObjId::new("b2")).await.unwrap());
}

#[tokio::test]
async fn delete_then_recreate_is_rejected_within_one_transaction() {
    let store = fresh_store().await;
    let mut tx = store.transaction(Owner::named("setup")).await.unwrap();
    tx.create(&bridge("b1")).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.transaction(Owner::named("resurrect")).await.unwrap();
    tx.delete::<Bridge>(&ObjId::new("b1")).await.unwrap();
    let err = tx.create(&bridge("b1")).await.unwrap_err();
    assert!(matches!(err, StoreError::InternalObjectMapper { .. }));
    tx.close().await;
}

#[tokio::test]
async fn transaction_sees_its_own_writes() {
    let store = fresh_store().await;
    let mut tx = store.transaction(Owner::named("writer")).await.unwrap();
    tx.create(&bridge("b1")).await.unwrap();
    tx.create(&port("p1", Some("b1"))).await.unwrap();

    // The pending inverse update is visible to reads inside the
    // transaction.
    let b1: Bridge = tx.get(&ObjId::new("b1")).await.unwrap();
    assert_eq!(b1.port_ids, vec!["p1".to_string()]);
    tx.close().await;

    // Nothing leaked: the transaction was discarded.
    assert!(!store.exists::<Bridge>(&ObjId::new("b1")).await.unwrap());
}

#[tokio::test]
async fn concurrent_transactions_on_the_same_object_serialize() {
    let store = fresh_store().await;
    let mut tx = store.transaction(Owner::named("setup")).await.unwrap();
    tx.create(&bridge("b1")).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx1 = store.transaction(Owner::named("one")).await.unwrap();
    let mut tx2 = store.transaction(Owner::named("two")).await.unwrap();

    let mut b_from_1: Bridge = tx1.get(&ObjId::new("b1")).await.unwrap();
    let mut b_from_2: Bridge = tx2.get(&ObjId::new("b1")).await.unwrap();

    b_from_1.name = "from-one".to_string();
    tx1.update(&b_from_1).await.unwrap();
    tx1.commit().await.unwrap();

    b_from_2.name = "from-two".to_string();
    tx2.update(&b_from_2).await.unwrap();
    let err = tx2.commit().await.unwrap_err();
    assert!(matches!(err, StoreError::ConcurrentModification { .. }));

    let after: Bridge = store.get(&ObjId::new("b1")).await.unwrap();
    assert_eq!(after.name, "from-one");
}

#[tokio::test]
async fn snapshot_ceiling_aborts_late_reads() {
    let store = fresh_store().await;
    let mut tx = store.transaction(Owner::named("setup")).await.unwrap();
    tx.create(&bridge("b1")).await.unwrap();
    tx.commit().await.unwrap();

    // Open before the concurrent write, read after it: the read itself must
    // abort, not just the commit.
    let mut stale = store.transaction(Owner::named("stale")).await.unwrap();

    let mut tx = store.transaction(Owner::named("racer")).await.unwrap();
    let mut b1: Bridge = tx.get(&ObjId::new("b1")).await.unwrap();
    b1.name = "raced".to_string();
    tx.update(&b1).await.unwrap();
    tx.commit().await.unwrap();

    let err = stale.get::<Bridge>(&ObjId::new("b1")).await.unwrap_err();
    assert!(matches!(err, StoreError::ConcurrentModification { .. }));
    stale.close().await;
}

#[tokio::test]
async fn try_transaction_retries_until_it_wins() {
    let store = build_store(
        MemoryBackend::new(),
        StoreConfig::default().transaction_attempts(3),
    )
    .await;
    let mut tx = store.transaction(Owner::named("setup")).await.unwrap();
    tx.create(&bridge("b1")).await.unwrap();
    tx.commit().await.unwrap();

    let interferer = store.clone();
    let calls = Arc::new(AtomicUsize::new(0));
    let result = store
        .try_transaction(Owner::named("persistent"), {
            let interferer = interferer.clone();
            let calls = calls.clone();
            move |tx: &mut Transaction<MemoryBackend>| {
                let interferer = interferer.clone();
                let calls = calls.clone();
                Box::pin(async move {
                    let attempt = calls.fetch_add(1, Ordering::SeqCst);
                    let mut b1: Bridge = tx.get(&ObjId::new("b1")).await?;
                    if attempt == 0 {
                        // Sneak in a conflicting commit mid-body on the first
                        // attempt only.
                        let mut other = interferer.transaction(Owner::named("sneak")).await?;
                        let mut theirs: Bridge = other.get(&ObjId::new("b1")).await?;
                        theirs.name = "sneaky".to_string();
                        other.update(&theirs).await?;
                        other.commit().await?;
                    }
                    b1.name = "final".to_string();
                    tx.update(&b1).await
                })
            }
        })
        .await;

    assert!(result.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.metrics().tx_retries(), 1);
    let after: Bridge = store.get(&ObjId::new("b1")).await.unwrap();
    assert_eq!(after.name, "final");
}

#[tokio::test]
async fn try_transaction_gives_up_after_configured_attempts() {
    let store = build_store(
        MemoryBackend::new(),
        StoreConfig::default().transaction_attempts(2),
    )
    .await;
    let mut tx = store.transaction(Owner::named("setup")).await.unwrap();
    tx.create(&bridge("b1")).await.unwrap();
    tx.commit().await.unwrap();

    let interferer = store.clone();
    let calls = Arc::new(AtomicUsize::new(0));
    let err = store
        .try_transaction(Owner::named("unlucky"), {
            let interferer = interferer.clone();
            let calls = calls.clone();
            move |tx: &mut Transaction<MemoryBackend>| {
                let interferer = interferer.clone();
                let calls = calls.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let mut b1: Bridge = tx.get(&ObjId::new("b1")).await?;
                    let mut other = interferer.transaction(Owner::named("sneak")).await?;
                    let mut theirs: Bridge = other.get(&ObjId::new("b1")).await?;
                    theirs.name = format!("sneak-{}", calls.load(Ordering::SeqCst));
                    other.update(&theirs).await?;
                    other.commit().await?;
                    b1.name = "wanted".to_string();
                    tx.update(&b1).await
                })
            }
        })
        .await
        .unwrap_err();

    assert!(err.is_concurrent_modification());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn non_retriable_errors_abort_try_transaction_immediately() {
    let store = fresh_store().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let err = store
        .try_transaction(Owner::named("reader"), {
            let calls = calls.clone();
            move |tx: &mut Transaction<MemoryBackend>| {
                let calls = calls.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tx.get::<Bridge>(&ObjId::new("ghost")).await.map(|_: Bridge| ())
                })
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::NotFound { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn raw_node_ops_commit_atomically_with_objects() {
    let store = fresh_store().await;
    let mut tx = store.transaction(Owner::named("mixed")).await.unwrap();
    tx.create(&bridge("b1")).await.unwrap();
    tx.create_node("/topograph/zoom/1/extras", b"aux".to_vec());
    tx.commit().await.unwrap();
    assert!(store.exists::<Bridge>(&ObjId::new("b1")).await.unwrap());

    let mut tx = store.transaction(Owner::named("mixed")).await.unwrap();
    tx.update_node("/topograph/zoom/1/extras", b"aux2".to_vec());
    tx.commit().await.unwrap();

    let mut tx = store.transaction(Owner::named("mixed")).await.unwrap();
    tx.delete_node("/topograph/zoom/1/extras");
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn raw_node_errors_map_to_path_errors() {
    let store = fresh_store().await;

    let mut tx = store.transaction(Owner::named("raw")).await.unwrap();
    tx.update_node("/topograph/zoom/1/missing", b"x".to_vec());
    let err = tx.commit().await.unwrap_err();
    assert!(
        matches!(&err, StoreError::StorageNodeNotFound { path }
            if path == "/topograph/zoom/1/missing"),
        "unexpected error: {err}"
    );

    let mut tx = store.transaction(Owner::named("raw")).await.unwrap();
    tx.create_node("/topograph/zoom/1/models", b"".to_vec());
    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, StoreError::StorageNodeExists { .. }));
}

#[tokio::test]
async fn recursive_node_delete_takes_descendants() {
    let store = fresh_store().await;
    let mut tx = store.transaction(Owner::named("raw")).await.unwrap();
    tx.create_node("/topograph/zoom/1/tree", b"".to_vec());
    tx.create_node("/topograph/zoom/1/tree/a", b"".to_vec());
    tx.create_node("/topograph/zoom/1/tree/a/b", b"".to_vec());
    tx.commit().await.unwrap();

    let mut tx = store.transaction(Owner::named("raw")).await.unwrap();
    tx.delete_node_recursive("/topograph/zoom/1/tree");
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn failed_multi_leaves_no_partial_writes() {
    let store = fresh_store().await;
    let err = store
        .multi(vec![
            PersistOp::create(&bridge("b1")).unwrap(),
            PersistOp::create(&port("p1", Some("b1"))).unwrap(),
            PersistOp::delete_node("/topograph/zoom/1/not-there"),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::StorageNodeNotFound { .. }));

    assert!(!store.exists::<Bridge>(&ObjId::new("b1")).await.unwrap());
    assert!(!store.exists::<Port>(&ObjId::new("p1")).await.unwrap());
}

#[tokio::test]
async fn provenance_records_writer_and_skips_unchanged_rewrites() {
    let backend = MemoryBackend::new();
    let store = build_store(backend.clone(), StoreConfig::default()).await;
    let layout = PathLayout::new("/topograph");
    let prov_path = layout.provenance_path("Bridge", &ObjId::new("b1"));

    let mut tx = store.transaction(Owner::named("alice")).await.unwrap();
    tx.create(&bridge("b1")).await.unwrap();
    tx.commit().await.unwrap();
    let rec = store.provenance::<Bridge>(&ObjId::new("b1")).await.unwrap();
    assert_eq!(rec.owner, Owner::named("alice"));
    assert_eq!(rec.change, ChangeKind::Create);

    // First update rewrites provenance (change kind flips to Update).
    let mut tx = store.transaction(Owner::named("alice")).await.unwrap();
    let mut b: Bridge = tx.get(&ObjId::new("b1")).await.unwrap();
    b.name = "one".to_string();
    tx.update(&b).await.unwrap();
    tx.commit().await.unwrap();
    let after_first = backend.exists(&prov_path).await.unwrap().unwrap().version;

    // Second update by the same owner encodes identical provenance bytes
    // and is skipped.
    let mut tx = store.transaction(Owner::named("alice")).await.unwrap();
    let mut b: Bridge = tx.get(&ObjId::new("b1")).await.unwrap();
    b.name = "two".to_string();
    tx.update(&b).await.unwrap();
    tx.commit().await.unwrap();
    let after_second = backend.exists(&prov_path).await.unwrap().unwrap().version;
    assert_eq!(after_first, after_second);

    // A different owner forces a provenance write again.
    let mut tx = store.transaction(Owner::named("bob")).await.unwrap();
    let mut b: Bridge = tx.get(&ObjId::new("b1")).await.unwrap();
    b.name = "three".to_string();
    tx.update(&b).await.unwrap();
    tx.commit().await.unwrap();
    let after_third = backend.exists(&prov_path).await.unwrap().unwrap().version;
    assert_eq!(after_third, after_second + 1);
    let rec = store.provenance::<Bridge>(&ObjId::new("b1")).await.unwrap();
    assert_eq!(rec.owner, Owner::named("bob"));
}

#[tokio::test]
async fn lock_free_mode_follows_the_lock_node() {
    let backend = MemoryBackend::new();
    let store = build_store(backend.clone(), StoreConfig::default()).await;
    let lock_path = PathLayout::new("/topograph").topology_lock_path();

    // The lock node exists after build, so locking is on.
    assert!(!store.is_lock_free());

    backend.delete(&lock_path, None).await.unwrap();
    wait_until(|| store.is_lock_free()).await;

    // Writes still work in lock-free mode.
    store
        .try_transaction(Owner::named("free"), |tx| {
            Box::pin(async move { tx.create(&bridge("b1")).await })
        })
        .await
        .unwrap();

    backend
        .create(&lock_path, Vec::new(), topograph::CreateMode::Persistent)
        .await
        .unwrap();
    wait_until(|| !store.is_lock_free()).await;
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
