//! Strata Test Utilities
//!
//! Shared test infrastructure for the Strata workspace:
//! - A scriptable in-memory origin with a manual clock
//! - A fixture model registry (Parent / Child / Note)
//! - Proptest generators for models, ids and blob paths
//! - Assertions for Strata-specific error classes

pub use strata_core::{
    AssociationValue, ChangeSet, Freshness, IdKind, LayerIndex, Model, ModelDescriptor, ModelId, ModelRegistry,
    OpResponse, OpResult, RequestOp, StrataConfig, StrataError, StrataResult, TimeMs, Verb,
};
pub use strata_storage::{CacheLayer, LayeredStore, LmdbLayer, MemoryLayer, Origin};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use strata_core::ConnectionError;

/// Start of the mock clock: 2024-01-01T00:00:00Z.
pub const EPOCH_MS: TimeMs = 1_704_067_200_000;

/// Route `tracing` output to the test harness. Safe to call repeatedly.
pub fn init_test_logging() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("strata_storage=debug,warn")))
        .with_test_writer()
        .try_init();
}

// ============================================================================
// MOCK ORIGIN
// ============================================================================

#[derive(Debug, Default)]
struct OriginState {
    records: HashMap<(String, ModelId), (Arc<Model>, String)>,
    blobs: HashMap<String, (Arc<Vec<u8>>, String)>,
    executed: Vec<(String, Value)>,
    log: Vec<(Verb, String)>,
}

/// In-memory origin with a manual clock.
///
/// Every record and blob carries an etag that changes on each write. A
/// read whose request etag matches answers "not modified": `exists` with
/// no result. Unreachable origins fail with a `Connection` error.
#[derive(Debug)]
pub struct MockOrigin {
    state: Mutex<OriginState>,
    clock: AtomicI64,
    reachable: AtomicBool,
    calls: AtomicUsize,
    next_id: AtomicI64,
    version: AtomicI64,
}

impl Default for MockOrigin {
    fn default() -> Self {
        Self::new()
    }
}

impl MockOrigin {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(OriginState::default()),
            clock: AtomicI64::new(EPOCH_MS),
            reachable: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            next_id: AtomicI64::new(1000),
            version: AtomicI64::new(0),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, OriginState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_etag(&self) -> String {
        format!("v{}", self.version.fetch_add(1, Ordering::SeqCst) + 1)
    }

    // === Scripting ===

    /// Store a record directly, bypassing the request log.
    pub fn seed(&self, model: Model) -> Arc<Model> {
        let id = model
            .id
            .clone()
            .unwrap_or_else(|| ModelId::Int(self.next_id.fetch_add(1, Ordering::SeqCst)));
        let model = Arc::new(Model {
            id: Some(id.clone()),
            ..model.detached()
        });
        let etag = self.next_etag();
        self.state()
            .records
            .insert((model.model_type.clone(), id), (model.clone(), etag));
        model
    }

    /// Store a blob directly. Returns its etag.
    pub fn seed_blob(&self, path: &str, bytes: &[u8]) -> String {
        let etag = self.next_etag();
        self.state()
            .blobs
            .insert(path.to_string(), (Arc::new(bytes.to_vec()), etag.clone()));
        etag
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_time(&self, now: TimeMs) {
        self.clock.store(now, Ordering::SeqCst);
    }

    /// Move the clock forward by `ms`.
    pub fn advance(&self, ms: i64) -> TimeMs {
        self.clock.fetch_add(ms, Ordering::SeqCst) + ms
    }

    /// Requests answered while reachable.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Verb and key of every answered request, in order.
    pub fn request_log(&self) -> Vec<(Verb, String)> {
        self.state().log.clone()
    }

    pub fn record(&self, model_type: &str, id: impl Into<ModelId>) -> Option<Arc<Model>> {
        self.state()
            .records
            .get(&(model_type.to_string(), id.into()))
            .map(|(model, _)| model.clone())
    }

    pub fn record_count(&self, model_type: &str) -> usize {
        self.state().records.keys().filter(|(t, _)| t == model_type).count()
    }

    pub fn blob(&self, path: &str) -> Option<Arc<Vec<u8>>> {
        self.state().blobs.get(path).map(|(bytes, _)| bytes.clone())
    }

    /// Actions received through `Execute`, with their parameters.
    pub fn executed(&self) -> Vec<(String, Value)> {
        self.state().executed.clone()
    }

    fn matches(model: &Model, criteria: &Value) -> bool {
        match criteria.as_object() {
            Some(filters) => filters.iter().all(|(property, expected)| match property.as_str() {
                "id" => model.id.as_ref().map(ModelId::to_value).as_ref() == Some(expected),
                _ => model.get(property) == Some(expected),
            }),
            None => true,
        }
    }

    fn answer(&self, request: Arc<RequestOp>) -> OpResponse {
        let now = self.clock.load(Ordering::SeqCst);
        let found = |result: OpResult, etag: Option<String>| {
            OpResponse::found(request.clone(), result, now, "origin", LayerIndex::Origin).with_etag(etag)
        };
        let missing = || OpResponse {
            arrived_at_ms: now,
            ..OpResponse::missing(request.clone(), "origin", LayerIndex::Origin)
        };
        let not_modified = |etag: &str| request.etag.as_deref() == Some(etag);

        let mut state = self.state();
        state.log.push((request.verb, request.key()));
        let record_key = |id: &ModelId| (request.model_type.clone(), id.clone());

        match request.verb {
            Verb::Get => match request.id.as_ref().and_then(|id| state.records.get(&record_key(id))) {
                Some((_, etag)) if not_modified(etag.as_str()) => found(OpResult::None, Some(etag.clone())),
                Some((model, etag)) => found(OpResult::Model(model.clone()), Some(etag.clone())),
                None => missing(),
            },
            Verb::Query => {
                let criteria = request.criteria.clone().unwrap_or(Value::Null);
                let mut models: Vec<Arc<Model>> = state
                    .records
                    .iter()
                    .filter(|((model_type, _), (model, _))| {
                        model_type == &request.model_type && Self::matches(model, &criteria)
                    })
                    .map(|(_, (model, _))| model.clone())
                    .collect();
                models.sort_by(|a, b| a.id.cmp(&b.id));
                found(OpResult::Models(models), None)
            }
            Verb::Create | Verb::Replace => {
                let Some(model) = request.model() else {
                    return missing();
                };
                let id = match &model.id {
                    Some(id) if !id.is_local() => id.clone(),
                    _ => ModelId::Int(self.next_id.fetch_add(1, Ordering::SeqCst)),
                };
                let stored = Arc::new(Model {
                    id: Some(id.clone()),
                    ..model.detached()
                });
                let etag = self.next_etag();
                state.records.insert(record_key(&id), (stored.clone(), etag.clone()));
                found(OpResult::Model(stored), Some(etag))
            }
            Verb::Update => {
                let Some(id) = request.id.clone() else {
                    return missing();
                };
                let base = state
                    .records
                    .get(&record_key(&id))
                    .map(|(model, _)| model.clone())
                    .or_else(|| request.extra.clone());
                match (base, request.value.as_changes()) {
                    (Some(base), Some(changes)) => {
                        let updated = Arc::new(changes.apply(&base));
                        let etag = self.next_etag();
                        state.records.insert(record_key(&id), (updated.clone(), etag.clone()));
                        found(OpResult::Model(updated), Some(etag))
                    }
                    _ => missing(),
                }
            }
            Verb::Destroy => {
                if let Some(id) = &request.id {
                    state.records.remove(&record_key(id));
                }
                missing()
            }
            Verb::Execute => {
                let action = request.action.clone().unwrap_or_default();
                let params = match &request.value {
                    strata_core::RequestValue::Params(params) => params.clone(),
                    _ => Value::Null,
                };
                state.executed.push((action.clone(), params.clone()));
                found(OpResult::Value(json!({ "action": action, "params": params })), None)
            }
            Verb::BlobGet => match request.path.as_ref().and_then(|path| state.blobs.get(path)) {
                Some((_, etag)) if not_modified(etag.as_str()) => found(OpResult::None, Some(etag.clone())),
                Some((bytes, etag)) => found(OpResult::Bytes(bytes.clone()), Some(etag.clone())),
                None => missing(),
            },
            Verb::BlobPut => match (&request.path, request.value.as_bytes()) {
                (Some(path), Some(bytes)) => {
                    let etag = self.next_etag();
                    state.blobs.insert(path.clone(), (bytes.clone(), etag.clone()));
                    found(OpResult::Bytes(bytes.clone()), Some(etag))
                }
                _ => missing(),
            },
            Verb::BlobDestroy => {
                if let Some(path) = &request.path {
                    state.blobs.remove(path);
                }
                missing()
            }
            Verb::GetCollection => missing(),
        }
    }
}

#[async_trait]
impl Origin for MockOrigin {
    fn name(&self) -> &str {
        "origin"
    }

    async fn process_request(&self, request: Arc<RequestOp>, online: bool) -> StrataResult<OpResponse> {
        if !online {
            // No local execution support.
            return Ok(OpResponse::disconnected(request, "origin", LayerIndex::Origin));
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(ConnectionError::OriginUnreachable {
                model_type: request.model_type.clone(),
                reason: "mock origin unreachable".to_string(),
            }
            .into());
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.answer(request))
    }

    fn now_ms(&self) -> TimeMs {
        self.clock.load(Ordering::SeqCst)
    }

    fn list_model_types(&self) -> Vec<String> {
        vec!["Parent".to_string(), "Child".to_string(), "Note".to_string()]
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Strata values.

    use super::*;
    use proptest::prelude::*;

    /// Origin-assigned integer ids.
    pub fn arb_int_id() -> impl Strategy<Value = ModelId> {
        (1i64..1_000_000).prop_map(ModelId::Int)
    }

    /// Any id, including offline negatives and awkward text.
    pub fn arb_model_id() -> impl Strategy<Value = ModelId> {
        prop_oneof![
            any::<i64>().prop_map(ModelId::Int),
            "[a-zA-Z0-9 ./%_-]{0,24}".prop_map(ModelId::Text),
        ]
    }

    /// Forward-slash blob paths.
    pub fn arb_blob_path() -> impl Strategy<Value = String> {
        prop::collection::vec("[a-z0-9]{1,8}", 1..5).prop_map(|segments| format!("{}.bin", segments.join("/")))
    }

    pub fn arb_freshness() -> impl Strategy<Value = Freshness> {
        prop_oneof![
            Just(Freshness::Any),
            Just(Freshness::Insist),
            Just(Freshness::Freshest),
            Just(Freshness::Default),
            (0u32..86_400).prop_map(Freshness::MaxAge),
        ]
    }

    /// A Child with an origin id and a parent.
    pub fn arb_child() -> impl Strategy<Value = Model> {
        (arb_int_id(), 1i64..100, "[a-zA-Z ]{1,20}").prop_map(|(id, parent_id, name)| {
            Model::new("Child")
                .with_id(id)
                .with("parent_id", parent_id)
                .with("name", name)
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built registries, models and stores.

    use super::*;
    use std::path::Path;
    use strata_core::{Association, FieldKind};

    /// Parent has many Children and one Favorite child, an Avatar blob and
    /// a derived NameLength. Child belongs to Parent. Note has text ids.
    pub fn registry() -> ModelRegistry {
        let parent = ModelDescriptor::new("Parent", IdKind::Integer)
            .field("name", FieldKind::Text)
            .field("avatar_path", FieldKind::Text)
            .has_many("Children", "Child", "parent_id")
            .has_one("Favorite", "Child", "parent_id")
            .field("Avatar", FieldKind::Json)
            .association(
                "Avatar",
                Association::from_blob("avatar_path", |bytes| {
                    String::from_utf8(bytes.to_vec())
                        .map(Value::from)
                        .map_err(|err| err.to_string())
                }),
            )
            .field("NameLength", FieldKind::Integer)
            .association(
                "NameLength",
                Association::from_property(
                    "name",
                    |value, args| {
                        let len = value.as_str().map_or(0, |s| s.chars().count()) as i64;
                        let bonus = args.first().and_then(Value::as_i64).unwrap_or(0);
                        Ok(Value::from(len + bonus))
                    },
                    vec![Value::from(0)],
                ),
            );

        let child = ModelDescriptor::new("Child", IdKind::Integer)
            .field("name", FieldKind::Text)
            .field("parent_id", FieldKind::Integer)
            .belongs_to("Parent", "Parent", "parent_id");

        let note = ModelDescriptor::new("Note", IdKind::Text).field("body", FieldKind::Text);

        let mut registry = ModelRegistry::new();
        for descriptor in [parent, child, note] {
            if let Err(err) = registry.register(descriptor) {
                panic!("fixture registry rejected: {err}");
            }
        }
        registry
    }

    pub fn parent(id: i64, name: &str) -> Model {
        Model::new("Parent").with_id(id).with("name", name)
    }

    pub fn child(id: i64, parent_id: i64, name: &str) -> Model {
        Model::new("Child")
            .with_id(id)
            .with("parent_id", parent_id)
            .with("name", name)
    }

    /// Store configuration rooted at `dir`.
    pub fn config(dir: &Path) -> StrataConfig {
        StrataConfig::new(dir)
    }

    /// A store over `layers` with the fixture registry.
    pub async fn store(
        config: StrataConfig,
        origin: Arc<MockOrigin>,
        layers: Vec<Arc<dyn CacheLayer>>,
    ) -> LayeredStore {
        match LayeredStore::open(config, Arc::new(registry()), origin, layers).await {
            Ok(store) => store,
            Err(err) => panic!("fixture store failed to open: {err}"),
        }
    }

    /// Two memory layers, "hot" then "warm".
    pub fn memory_layers() -> (Arc<MemoryLayer>, Arc<MemoryLayer>) {
        (Arc::new(MemoryLayer::new("hot")), Arc::new(MemoryLayer::new("warm")))
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for Strata results.

    use super::*;

    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &StrataResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert a `DataNotAvailableOffline` failure.
    #[track_caller]
    pub fn assert_not_available<T: std::fmt::Debug>(result: &StrataResult<T>) {
        match result {
            Err(err) if err.is_offline() => {}
            other => panic!("Expected DataNotAvailableOffline, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_argument_error<T: std::fmt::Debug>(result: &StrataResult<T>) {
        match result {
            Err(StrataError::Argument(_)) => {}
            other => panic!("Expected Argument error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_queue_error<T: std::fmt::Debug>(result: &StrataResult<T>) {
        match result {
            Err(StrataError::Queue(_)) => {}
            other => panic!("Expected Queue error, got: {:?}", other),
        }
    }

    /// Assert the response came from `layer`.
    #[track_caller]
    pub fn assert_served_by(response: &OpResponse, layer: LayerIndex) {
        assert_eq!(
            response.layer, layer,
            "Expected response from {:?}, got {:?} ({})",
            layer, response.layer, response.source_name
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================
