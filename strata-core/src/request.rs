//! Request descriptions.
//!
//! A [`RequestOp`] is an immutable description of one operation. It is
//! built with the constructors below, stamped with the logical request time
//! by the orchestrator, and then shared behind an `Arc` by every layer,
//! the origin, and the pending-change queue.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::freshness::Freshness;
use crate::model::{ChangeSet, Model, ModelId};
use crate::TimeMs;

/// Operation verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verb {
    Create,
    Get,
    Update,
    Replace,
    Destroy,
    Query,
    GetCollection,
    Execute,
    BlobGet,
    BlobPut,
    BlobDestroy,
}

impl Verb {
    /// Reads answered through the freshness-governed layer walk.
    pub fn is_read(&self) -> bool {
        matches!(self, Self::Get | Self::Query | Self::BlobGet)
    }

    /// Writes that are queued while offline.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::Create
                | Self::Update
                | Self::Replace
                | Self::Destroy
                | Self::Execute
                | Self::BlobPut
                | Self::BlobDestroy
        )
    }

    pub fn is_blob(&self) -> bool {
        matches!(self, Self::BlobGet | Self::BlobPut | Self::BlobDestroy)
    }
}

/// Payload carried by a request.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RequestValue {
    #[default]
    None,
    /// Full model (create, replace, destroy).
    Model(Arc<Model>),
    /// Attribute edits (update).
    Changes(ChangeSet),
    /// Raw bytes (blob put).
    Bytes(Arc<Vec<u8>>),
    /// Free-form parameters (execute).
    Params(Value),
}

impl RequestValue {
    pub fn as_model(&self) -> Option<&Arc<Model>> {
        match self {
            Self::Model(model) => Some(model),
            _ => None,
        }
    }

    pub fn as_changes(&self) -> Option<&ChangeSet> {
        match self {
            Self::Changes(changes) => Some(changes),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Arc<Vec<u8>>> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Immutable description of one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOp {
    /// Logical request time; zero until stamped.
    pub timestamp: TimeMs,
    /// Target model type. Empty for blob verbs.
    pub model_type: String,
    pub verb: Verb,
    pub id: Option<ModelId>,
    pub value: RequestValue,
    /// Name under which a query's id list is cached.
    pub collection_key: Option<String>,
    /// Opaque filter forwarded to the origin.
    pub criteria: Option<Value>,
    /// Blob path for blob verbs.
    pub path: Option<String>,
    /// Action name for execute.
    pub action: Option<String>,
    /// Association names to resolve on the result.
    pub populate: Vec<String>,
    pub freshness: Freshness,
    pub populate_freshness: Freshness,
    /// Age accepted when the origin is unreachable. `None` means never
    /// fall back; `Some(Default)` resolves against the configured default.
    pub fallback_freshness: Option<Freshness>,
    /// Pin the result against cache clearing.
    pub hold: bool,
    /// Prior full value, used to synthesize offline update results.
    pub extra: Option<Arc<Model>>,
    /// Etag of the cached candidate, forwarded to the origin.
    pub etag: Option<String>,
}

impl RequestOp {
    /// A bare request for `verb` with every option at its default.
    pub fn new(verb: Verb, model_type: impl Into<String>) -> Self {
        Self {
            timestamp: 0,
            model_type: model_type.into(),
            verb,
            id: None,
            value: RequestValue::None,
            collection_key: None,
            criteria: None,
            path: None,
            action: None,
            populate: Vec::new(),
            freshness: Freshness::Default,
            populate_freshness: Freshness::Default,
            fallback_freshness: Some(Freshness::Default),
            hold: false,
            extra: None,
            etag: None,
        }
    }

    // === Constructors ===

    pub fn get(model_type: impl Into<String>, id: impl Into<ModelId>) -> Self {
        let mut op = Self::new(Verb::Get, model_type);
        op.id = Some(id.into());
        op
    }

    pub fn query(model_type: impl Into<String>, criteria: Value, collection_key: impl Into<String>) -> Self {
        let mut op = Self::new(Verb::Query, model_type);
        op.criteria = Some(criteria);
        op.collection_key = Some(collection_key.into());
        op
    }

    pub fn get_collection(model_type: impl Into<String>, collection_key: impl Into<String>) -> Self {
        let mut op = Self::new(Verb::GetCollection, model_type);
        op.collection_key = Some(collection_key.into());
        op
    }

    pub fn create(model: Model) -> Self {
        let mut op = Self::new(Verb::Create, model.model_type.clone());
        op.id = model.id.clone();
        op.value = RequestValue::Model(Arc::new(model));
        op
    }

    pub fn replace(model: Model) -> Self {
        let mut op = Self::new(Verb::Replace, model.model_type.clone());
        op.id = model.id.clone();
        op.value = RequestValue::Model(Arc::new(model));
        op
    }

    /// Update `prior` with `changes`. The prior value travels in `extra`.
    pub fn update(prior: Arc<Model>, changes: ChangeSet) -> Self {
        let mut op = Self::new(Verb::Update, prior.model_type.clone());
        op.id = prior.id.clone();
        op.value = RequestValue::Changes(changes);
        op.extra = Some(prior);
        op
    }

    pub fn destroy(model: Arc<Model>) -> Self {
        let mut op = Self::new(Verb::Destroy, model.model_type.clone());
        op.id = model.id.clone();
        op.value = RequestValue::Model(model);
        op
    }

    pub fn execute(model_type: impl Into<String>, action: impl Into<String>, params: Value) -> Self {
        let mut op = Self::new(Verb::Execute, model_type);
        op.action = Some(action.into());
        op.value = RequestValue::Params(params);
        op
    }

    pub fn blob_get(path: impl Into<String>) -> Self {
        let mut op = Self::new(Verb::BlobGet, "");
        op.path = Some(path.into());
        op
    }

    pub fn blob_put(path: impl Into<String>, bytes: Vec<u8>) -> Self {
        let mut op = Self::new(Verb::BlobPut, "");
        op.path = Some(path.into());
        op.value = RequestValue::Bytes(Arc::new(bytes));
        op
    }

    pub fn blob_destroy(path: impl Into<String>) -> Self {
        let mut op = Self::new(Verb::BlobDestroy, "");
        op.path = Some(path.into());
        op
    }

    // === Modifiers ===

    pub fn with_freshness(mut self, freshness: Freshness) -> Self {
        self.freshness = freshness;
        self
    }

    pub fn with_fallback(mut self, fallback: Freshness) -> Self {
        self.fallback_freshness = Some(fallback);
        self
    }

    /// Never fall back to a stale cached value.
    pub fn without_fallback(mut self) -> Self {
        self.fallback_freshness = None;
        self
    }

    pub fn with_populate<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.populate = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_populate_freshness(mut self, freshness: Freshness) -> Self {
        self.populate_freshness = freshness;
        self
    }

    pub fn with_hold(mut self, hold: bool) -> Self {
        self.hold = hold;
        self
    }

    pub fn with_criteria(mut self, criteria: Value) -> Self {
        self.criteria = Some(criteria);
        self
    }

    pub fn with_etag(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    /// Set the logical request time.
    pub fn at(mut self, timestamp: TimeMs) -> Self {
        self.timestamp = timestamp;
        self
    }

    // === Accessors ===

    /// Human-readable key for logs and errors.
    pub fn key(&self) -> String {
        if let Some(path) = &self.path {
            return path.clone();
        }
        if let Some(key) = &self.collection_key {
            return key.clone();
        }
        if let Some(action) = &self.action {
            return action.clone();
        }
        self.id.as_ref().map(ToString::to_string).unwrap_or_default()
    }

    pub fn model(&self) -> Option<&Arc<Model>> {
        self.value.as_model()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_builder() {
        let op = RequestOp::get("Person", 12)
            .with_freshness(Freshness::MaxAge(60))
            .with_fallback(Freshness::Any)
            .with_populate(["friends"])
            .with_hold(true)
            .at(1_000);

        assert_eq!(op.verb, Verb::Get);
        assert_eq!(op.id, Some(ModelId::Int(12)));
        assert_eq!(op.populate, vec!["friends".to_string()]);
        assert_eq!(op.fallback_freshness, Some(Freshness::Any));
        assert!(op.hold);
        assert_eq!(op.timestamp, 1_000);
        assert_eq!(op.key(), "12");
    }

    #[test]
    fn test_update_carries_prior_value() {
        let prior = Arc::new(Model::new("Person").with_id(3).with("name", "a"));
        let op = RequestOp::update(prior.clone(), ChangeSet::new().set("name", "b"));
        assert_eq!(op.id, Some(ModelId::Int(3)));
        assert!(Arc::ptr_eq(op.extra.as_ref().expect("extra"), &prior));
        assert_eq!(op.value.as_changes().map(ChangeSet::len), Some(1));
    }

    #[test]
    fn test_blob_and_query_keys() {
        assert_eq!(RequestOp::blob_get("person/1/a.png").key(), "person/1/a.png");
        let q = RequestOp::query("Child", json!({"parent_id": 1}), "Child:parent_id:1");
        assert_eq!(q.key(), "Child:parent_id:1");
        assert!(Verb::Query.is_read());
        assert!(Verb::BlobPut.is_write());
        assert!(!Verb::GetCollection.is_read());
    }
}
