//! Holds pin entries against bulk clearing.

use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;
use strata_core::{Freshness, ModelId, RequestOp};
use strata_storage::{CacheLayer, HoldScope, LmdbLayer};
use strata_test_utils::{fixtures, MockOrigin};
use tempfile::TempDir;

#[tokio::test]
async fn test_held_reads_survive_clear_all() {
    let dir = TempDir::new().unwrap();
    let origin = Arc::new(MockOrigin::new());
    origin.seed(fixtures::parent(1, "Ada"));
    origin.seed(fixtures::parent(2, "Bob"));
    origin.seed(fixtures::child(10, 1, "a"));
    origin.seed_blob("parent/1/avatar.txt", b"smile");
    let (hot, warm) = fixtures::memory_layers();
    let layers: Vec<Arc<dyn CacheLayer>> = vec![hot.clone(), warm.clone()];
    let store = fixtures::store(fixtures::config(dir.path()), origin.clone(), layers).await;

    store.process(RequestOp::get("Parent", 1).with_hold(true)).await.unwrap();
    store.get("Parent", 2).await.unwrap();
    store
        .process(RequestOp::query("Child", json!({"parent_id": 1}), "Child:parent_id:1").with_hold(true))
        .await
        .unwrap();
    store
        .process(RequestOp::blob_get("parent/1/avatar.txt").with_hold(true))
        .await
        .unwrap();

    let holds = store.holds();
    assert!(holds.is_held("Parent", &ModelId::Int(1)).await.unwrap());
    assert!(!holds.is_held("Parent", &ModelId::Int(2)).await.unwrap());
    assert!(holds.is_held("Child", &ModelId::Int(10)).await.unwrap());
    assert!(holds.is_collection_held("Child", "Child:parent_id:1").await.unwrap());
    assert!(holds.is_blob_held("parent/1/avatar.txt").await.unwrap());

    // Parent 2 in both layers.
    assert_eq!(store.clear_all(true, None).await, 2);
    for layer in [&hot, &warm] {
        assert!(layer.fetch(Arc::new(RequestOp::get("Parent", 1))).await.unwrap().exists);
        assert!(!layer.fetch(Arc::new(RequestOp::get("Parent", 2))).await.unwrap().exists);
        let query = RequestOp::query("Child", json!({"parent_id": 1}), "Child:parent_id:1");
        assert!(layer.fetch(Arc::new(query)).await.unwrap().exists);
        assert!(layer
            .fetch(Arc::new(RequestOp::blob_get("parent/1/avatar.txt")))
            .await
            .unwrap()
            .exists);
    }

    assert_eq!(holds.unhold_all(HoldScope::All, None).await.unwrap(), 4);
    // Parent 1, Child 10, the collection and the blob in both layers.
    assert_eq!(store.clear_all(true, None).await, 8);
    assert_eq!(hot.entry_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_clear_all_older_than_spares_recent_entries() {
    let dir = TempDir::new().unwrap();
    let origin = Arc::new(MockOrigin::new());
    origin.seed(fixtures::parent(1, "Ada"));
    origin.seed(fixtures::parent(2, "Bob"));
    let (hot, _) = fixtures::memory_layers();
    let store = fixtures::store(fixtures::config(dir.path()), origin.clone(), vec![hot.clone()]).await;

    store.get("Parent", 1).await.unwrap();
    let cutoff = origin.advance(10_000);
    store.get("Parent", 2).await.unwrap();

    assert_eq!(store.clear_all(false, Some(cutoff)).await, 1);
    assert!(!hot.fetch(Arc::new(RequestOp::get("Parent", 1))).await.unwrap().exists);
    assert!(hot.fetch(Arc::new(RequestOp::get("Parent", 2))).await.unwrap().exists);
}

#[tokio::test]
async fn test_hit_in_fastest_layer_is_not_pinned() {
    let dir = TempDir::new().unwrap();
    let origin = Arc::new(MockOrigin::new());
    origin.seed(fixtures::parent(1, "Ada"));
    let (hot, _) = fixtures::memory_layers();
    let store = fixtures::store(fixtures::config(dir.path()), origin, vec![hot]).await;

    store.get("Parent", 1).await.unwrap();
    store
        .process(RequestOp::get("Parent", 1).with_hold(true).with_freshness(Freshness::Any))
        .await
        .unwrap();
    assert!(!store.holds().is_held("Parent", &ModelId::Int(1)).await.unwrap());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_clear_all_removes_exactly_the_unheld(held in prop::collection::vec(any::<bool>(), 1..12)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let dir = TempDir::new().unwrap();
            let origin = Arc::new(MockOrigin::new());
            let disk = Arc::new(LmdbLayer::open("disk", dir.path().join("lmdb"), 16).unwrap());
            let store = fixtures::store(fixtures::config(dir.path()), origin.clone(), vec![disk.clone()]).await;

            for (i, pinned) in held.iter().enumerate() {
                let id = i as i64 + 1;
                origin.seed(fixtures::parent(id, "p"));
                store.process(RequestOp::get("Parent", id).with_hold(*pinned)).await.unwrap();
            }

            let unheld = held.iter().filter(|pinned| !**pinned).count() as u64;
            assert_eq!(store.clear_all(true, None).await, unheld);
            for (i, pinned) in held.iter().enumerate() {
                let request = Arc::new(RequestOp::get("Parent", i as i64 + 1));
                assert_eq!(disk.fetch(request).await.unwrap().exists, *pinned);
            }
        });
    }
}
