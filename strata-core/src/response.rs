//! Operation responses.

use std::sync::Arc;

use serde_json::Value;

use crate::model::{Model, ModelId};
use crate::request::RequestOp;
use crate::TimeMs;

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerIndex {
    /// Position in the configured cache chain; 0 is the fastest layer.
    Cache(usize),
    /// The origin.
    Origin,
    /// Synthesized locally while offline.
    Offline,
}

impl LayerIndex {
    /// Cache position, if this came from a cache layer.
    pub fn cache_index(&self) -> Option<usize> {
        match self {
            Self::Cache(i) => Some(*i),
            _ => None,
        }
    }

    /// True when served by the fastest layer.
    pub fn is_fastest(&self) -> bool {
        matches!(self, Self::Cache(0))
    }
}

/// Outcome payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum OpResult {
    #[default]
    None,
    Model(Arc<Model>),
    Models(Vec<Arc<Model>>),
    /// Literal id list (collections).
    Ids(Vec<ModelId>),
    Bytes(Arc<Vec<u8>>),
    /// Execute results.
    Value(Value),
}

impl OpResult {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::None => true,
            Self::Models(models) => models.is_empty(),
            Self::Ids(ids) => ids.is_empty(),
            Self::Value(value) => value.is_null(),
            Self::Model(_) | Self::Bytes(_) => false,
        }
    }
}

/// Immutable result of processing a [`RequestOp`].
#[derive(Debug, Clone, PartialEq)]
pub struct OpResponse {
    pub request: Arc<RequestOp>,
    /// Whether the source was reachable.
    pub connected: bool,
    pub exists: bool,
    pub result: OpResult,
    /// When the source captured this value.
    pub arrived_at_ms: TimeMs,
    pub source_name: String,
    pub layer: LayerIndex,
    pub etag: Option<String>,
}

impl OpResponse {
    /// A hit carrying `result`.
    pub fn found(
        request: Arc<RequestOp>,
        result: OpResult,
        arrived_at_ms: TimeMs,
        source_name: impl Into<String>,
        layer: LayerIndex,
    ) -> Self {
        Self {
            request,
            connected: true,
            exists: true,
            result,
            arrived_at_ms,
            source_name: source_name.into(),
            layer,
            etag: None,
        }
    }

    /// A reachable source that has no value.
    pub fn missing(request: Arc<RequestOp>, source_name: impl Into<String>, layer: LayerIndex) -> Self {
        Self {
            request,
            connected: true,
            exists: false,
            result: OpResult::None,
            arrived_at_ms: 0,
            source_name: source_name.into(),
            layer,
            etag: None,
        }
    }

    /// An unreachable source.
    pub fn disconnected(request: Arc<RequestOp>, source_name: impl Into<String>, layer: LayerIndex) -> Self {
        Self {
            connected: false,
            ..Self::missing(request, source_name, layer)
        }
    }

    pub fn with_etag(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    /// Same payload re-attributed to another source.
    pub fn relabel(mut self, source_name: impl Into<String>, layer: LayerIndex) -> Self {
        self.source_name = source_name.into();
        self.layer = layer;
        self
    }

    /// Always-enumerable projection of the model results.
    pub fn results(&self) -> Vec<Arc<Model>> {
        match &self.result {
            OpResult::Model(model) => vec![model.clone()],
            OpResult::Models(models) => models.clone(),
            _ => Vec::new(),
        }
    }

    pub fn first_result(&self) -> Option<Arc<Model>> {
        match &self.result {
            OpResult::Model(model) => Some(model.clone()),
            OpResult::Models(models) => models.first().cloned(),
            _ => None,
        }
    }

    /// Ids of the results, whether they are models or literal ids.
    pub fn result_ids(&self) -> Vec<ModelId> {
        match &self.result {
            OpResult::Ids(ids) => ids.clone(),
            OpResult::Model(model) => model.id.iter().cloned().collect(),
            OpResult::Models(models) => models.iter().filter_map(|m| m.id.clone()).collect(),
            _ => Vec::new(),
        }
    }

    pub fn bytes(&self) -> Option<&Arc<Vec<u8>>> {
        match &self.result {
            OpResult::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// True when an existing, non-empty value is carried.
    pub fn has_value(&self) -> bool {
        self.exists && !self.result.is_empty()
    }
}
