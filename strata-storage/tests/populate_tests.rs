//! Association population through the store.

use std::sync::Arc;

use serde_json::json;
use strata_core::{Freshness, LayerIndex, Model, ModelId, RequestOp};
use strata_test_utils::{assertions, fixtures, MockOrigin};
use tempfile::TempDir;

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn ids(models: &[Arc<Model>]) -> Vec<ModelId> {
    let mut ids: Vec<_> = models.iter().filter_map(|m| m.id.clone()).collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn test_parent_children_populate_shares_instances() {
    let dir = TempDir::new().unwrap();
    let origin = Arc::new(MockOrigin::new());
    origin.seed(fixtures::parent(1, "Ada"));
    origin.seed(fixtures::child(10, 1, "a"));
    origin.seed(fixtures::child(11, 1, "b"));
    origin.seed(fixtures::child(12, 2, "c"));
    let (hot, _) = fixtures::memory_layers();
    let store = fixtures::store(fixtures::config(dir.path()), origin.clone(), vec![hot]).await;

    let original = store.get("Parent", 1).await.unwrap().first_result().unwrap();

    let response = store
        .process(RequestOp::get("Parent", 1).with_populate(["Children"]))
        .await
        .unwrap();
    let parent = response.first_result().unwrap();
    let children = parent.association("Children").unwrap().as_many().unwrap();
    assert_eq!(ids(children), vec![ModelId::Int(10), ModelId::Int(11)]);

    // Associations land on a copy; the cached instance stays bare.
    assert!(!Arc::ptr_eq(&parent, &original));
    assert!(original.association("Children").is_none());

    let populated = store
        .populate(&children[..1], &names(&["Parent"]), Freshness::Default, false)
        .await
        .unwrap();
    let owner = populated[0].association("Parent").unwrap().as_one().unwrap();
    assert!(Arc::ptr_eq(owner, &original));

    // Parent, the child query, nothing else.
    assert_eq!(origin.call_count(), 2);
}

#[tokio::test]
async fn test_belongs_to_handles_missing_and_shared_owners() {
    let dir = TempDir::new().unwrap();
    let origin = Arc::new(MockOrigin::new());
    origin.seed(fixtures::parent(1, "Ada"));
    let (hot, _) = fixtures::memory_layers();
    let store = fixtures::store(fixtures::config(dir.path()), origin.clone(), vec![hot]).await;

    let orphan = Model::new("Child").with_id(3).with("name", "x");
    let children: Vec<Arc<Model>> = vec![
        Arc::new(fixtures::child(1, 1, "a")),
        Arc::new(orphan),
        Arc::new(fixtures::child(2, 1, "b")),
        Arc::new(fixtures::child(4, 77, "d")),
    ];
    let populated = store
        .populate(&children, &names(&["Parent"]), Freshness::Any, false)
        .await
        .unwrap();

    let first = populated[0].association("Parent").unwrap().as_one().unwrap();
    let third = populated[2].association("Parent").unwrap().as_one().unwrap();
    assert!(Arc::ptr_eq(first, third));
    assert!(populated[1].association("Parent").unwrap().as_one().is_none());
    assert!(populated[3].association("Parent").unwrap().as_one().is_none());
    // Owners 1 and 77, once each.
    assert_eq!(origin.call_count(), 2);
    // Inputs are untouched.
    assert!(children[0].association("Parent").is_none());
}

#[tokio::test]
async fn test_has_one_blob_and_property_associations() {
    let dir = TempDir::new().unwrap();
    let origin = Arc::new(MockOrigin::new());
    origin.seed(fixtures::parent(1, "Ada").with("avatar_path", "parent/1/avatar.txt"));
    origin.seed(fixtures::child(10, 1, "a"));
    origin.seed(fixtures::child(11, 1, "b"));
    origin.seed_blob("parent/1/avatar.txt", b"smile");
    let (hot, _) = fixtures::memory_layers();
    let store = fixtures::store(fixtures::config(dir.path()), origin.clone(), vec![hot]).await;

    let response = store
        .process(RequestOp::get("Parent", 1).with_populate(["Favorite", "Avatar", "NameLength"]))
        .await
        .unwrap();
    let parent = response.first_result().unwrap();

    let favorite = parent.association("Favorite").unwrap().as_one().unwrap();
    assert_eq!(favorite.id, Some(ModelId::Int(10)));
    assert_eq!(parent.association("Avatar").unwrap().as_value(), Some(&json!("smile")));
    assert_eq!(parent.association("NameLength").unwrap().as_value(), Some(&json!(3)));
}

#[tokio::test]
async fn test_populate_offline_uses_cache_and_degrades_to_empty() {
    let dir = TempDir::new().unwrap();
    let origin = Arc::new(MockOrigin::new());
    origin.seed(fixtures::parent(1, "Ada"));
    origin.seed(fixtures::parent(2, "Bob"));
    origin.seed(fixtures::child(10, 1, "a"));
    let (hot, _) = fixtures::memory_layers();
    let store = fixtures::store(fixtures::config(dir.path()), origin.clone(), vec![hot]).await;

    store
        .process(RequestOp::get("Parent", 1).with_populate(["Children"]))
        .await
        .unwrap();
    store.get("Parent", 2).await.unwrap();
    store.set_online(false);

    let one = store
        .process(RequestOp::get("Parent", 1).with_populate(["Children"]))
        .await
        .unwrap();
    assertions::assert_served_by(&one, LayerIndex::Cache(0));
    let children = one.first_result().unwrap();
    assert_eq!(children.association("Children").unwrap().as_many().unwrap().len(), 1);

    // Never queried while online: empty rather than an error.
    let two = store
        .process(RequestOp::get("Parent", 2).with_populate(["Children"]))
        .await
        .unwrap();
    let parent = two.first_result().unwrap();
    assert!(parent.association("Children").unwrap().as_many().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_association_fails_fast() {
    let dir = TempDir::new().unwrap();
    let origin = Arc::new(MockOrigin::new());
    let (hot, _) = fixtures::memory_layers();
    let store = fixtures::store(fixtures::config(dir.path()), origin.clone(), vec![hot]).await;

    let child = Arc::new(fixtures::child(1, 1, "a"));
    let result = store
        .populate(&[child], &names(&["Siblings"]), Freshness::Default, false)
        .await;
    assertions::assert_argument_error(&result);
    assert_eq!(origin.call_count(), 0);
}
