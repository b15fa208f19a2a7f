//! Cache layer trait and statistics.
//!
//! A layer is one tier of the cache chain. The orchestrator walks layers
//! fastest first, so index 0 should be the cheapest to read. Layers store
//! raw values only: never populated associations.

use std::sync::Arc;

use async_trait::async_trait;
use strata_core::{Model, ModelId, OpResponse, OpResult, RequestOp, StrataResult, TimeMs, Verb};

use crate::hold::HoldRegistry;

/// One tier of the cache chain.
///
/// # Fetch Contract
///
/// `fetch` returns a response with `exists == true` and the value's
/// arrival time when it holds the requested key, and a missing response
/// otherwise. The orchestrator assigns the layer index. Layers may treat
/// the request's freshness as a hint but the orchestrator re-evaluates
/// freshness against `arrived_at_ms` itself.
///
/// A `Query` is answered only when the collection and every member
/// record are present.
#[async_trait]
pub trait CacheLayer: Send + Sync {
    /// Name used in responses and logs.
    fn name(&self) -> &str;

    /// Look up the value for `request`.
    async fn fetch(&self, request: Arc<RequestOp>) -> StrataResult<OpResponse>;

    /// Store a record, or remove it with `None`.
    async fn store(
        &self,
        model_type: &str,
        id: &ModelId,
        model: Option<Arc<Model>>,
        arrived_at_ms: TimeMs,
        etag: Option<&str>,
    ) -> StrataResult<()>;

    /// Store the id list of a named collection.
    async fn store_collection(
        &self,
        model_type: &str,
        name: &str,
        ids: &[ModelId],
        arrived_at_ms: TimeMs,
    ) -> StrataResult<()>;

    /// Store blob bytes, or remove them with `None`.
    async fn store_blob(
        &self,
        path: &str,
        bytes: Option<Arc<Vec<u8>>>,
        arrived_at_ms: TimeMs,
        etag: Option<&str>,
    ) -> StrataResult<()>;

    /// Drop entries. With `holds`, held entries survive. With
    /// `older_than`, only entries that arrived before the cutoff go.
    /// Returns the number of entries removed.
    async fn clear_all(&self, holds: Option<&HoldRegistry>, older_than: Option<TimeMs>) -> StrataResult<u64>;

    /// Number of stored entries.
    async fn entry_count(&self) -> StrataResult<u64>;

    /// Store whatever `response` carries, keyed by its request.
    async fn store_response(&self, response: &OpResponse) -> StrataResult<()> {
        let request = &response.request;
        let arrived = response.arrived_at_ms;
        let etag = response.etag.as_deref();

        match request.verb {
            Verb::Get | Verb::Create | Verb::Update | Verb::Replace => {
                let model = match (&response.result, request.verb) {
                    (OpResult::Model(model), _) => Some(model.clone()),
                    (_, Verb::Create | Verb::Replace) => request.model().cloned(),
                    _ => None,
                };
                match model {
                    Some(model) if response.exists => {
                        let Some(id) = model.id.as_ref().or(request.id.as_ref()) else {
                            return Ok(());
                        };
                        self.store(&request.model_type, id, Some(raw(&model)), arrived, etag)
                            .await
                    }
                    _ => match &request.id {
                        Some(id) if !response.exists => {
                            self.store(&request.model_type, id, None, arrived, None).await
                        }
                        _ => Ok(()),
                    },
                }
            }
            Verb::Destroy => match &request.id {
                Some(id) => self.store(&request.model_type, id, None, arrived, None).await,
                None => Ok(()),
            },
            Verb::Query | Verb::GetCollection => {
                let Some(name) = &request.collection_key else {
                    return Ok(());
                };
                if !response.exists {
                    return Ok(());
                }
                for model in response.results() {
                    if let Some(id) = &model.id {
                        self.store(&request.model_type, id, Some(raw(&model)), arrived, None)
                            .await?;
                    }
                }
                self.store_collection(&request.model_type, name, &response.result_ids(), arrived)
                    .await
            }
            Verb::BlobGet | Verb::BlobPut | Verb::BlobDestroy => {
                let Some(path) = &request.path else {
                    return Ok(());
                };
                let carried = response.bytes().or_else(|| request.value.as_bytes());
                let bytes = match (request.verb, carried) {
                    (Verb::BlobDestroy, _) => None,
                    (_, Some(bytes)) if response.exists => Some(bytes.clone()),
                    _ if !response.exists => None,
                    _ => return Ok(()),
                };
                let etag = if bytes.is_some() { etag } else { None };
                self.store_blob(path, bytes, arrived, etag).await
            }
            Verb::Execute => Ok(()),
        }
    }
}

/// The instance to store: the same `Arc` unless associations must be stripped.
fn raw(model: &Arc<Model>) -> Arc<Model> {
    if model.associations.is_empty() {
        model.clone()
    } else {
        Arc::new(model.detached())
    }
}

/// Per-layer counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    /// Failures swallowed by the guard.
    pub errors: u64,
    pub entry_count: u64,
}

impl LayerStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
