//! Failure isolation for cache layers.
//!
//! The orchestrator only talks to layers through [`GuardedLayer`]. A
//! failing fetch reads as a miss and a failing store is dropped; both are
//! logged and counted so one broken tier never fails a request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use strata_core::{LayerIndex, ModelId, OpResponse, RequestOp, TimeMs};

use super::traits::{CacheLayer, LayerStats};
use crate::hold::HoldRegistry;

/// A cache layer at a fixed position in the chain.
pub struct GuardedLayer {
    layer: Arc<dyn CacheLayer>,
    index: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    errors: AtomicU64,
}

impl GuardedLayer {
    pub fn new(layer: Arc<dyn CacheLayer>, index: usize) -> Self {
        Self {
            layer,
            index,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        self.layer.name()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    fn failed(&self, operation: &str, key: &str, err: &strata_core::StrataError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            layer = %self.name(),
            index = self.index,
            operation,
            key,
            category = err.category(),
            error = %err,
            "cache layer failure ignored"
        );
    }

    /// Fetch, treating any failure as a miss.
    pub async fn fetch(&self, request: Arc<RequestOp>) -> OpResponse {
        let slot = LayerIndex::Cache(self.index);
        match self.layer.fetch(request.clone()).await {
            Ok(response) => {
                if response.exists {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                }
                let name = response.source_name.clone();
                response.relabel(name, slot)
            }
            Err(err) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.failed("fetch", &request.key(), &err);
                OpResponse::missing(request, self.name(), slot)
            }
        }
    }

    pub async fn store_response(&self, response: &OpResponse) {
        match self.layer.store_response(response).await {
            Ok(()) => {
                self.stores.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => self.failed("store", &response.request.key(), &err),
        }
    }

    /// Drop one record.
    pub async fn evict(&self, model_type: &str, id: &ModelId, at: TimeMs) {
        if let Err(err) = self.layer.store(model_type, id, None, at, None).await {
            self.failed("evict", &id.to_string(), &err);
        }
    }

    pub async fn clear_all(&self, holds: Option<&HoldRegistry>, older_than: Option<TimeMs>) -> u64 {
        match self.layer.clear_all(holds, older_than).await {
            Ok(removed) => removed,
            Err(err) => {
                self.failed("clear_all", "*", &err);
                0
            }
        }
    }

    /// Snapshot of this layer's counters.
    pub async fn stats(&self) -> LayerStats {
        let entry_count = match self.layer.entry_count().await {
            Ok(count) => count,
            Err(err) => {
                self.failed("entry_count", "*", &err);
                0
            }
        };
        LayerStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            entry_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory_backend::MemoryLayer;
    use async_trait::async_trait;
    use strata_core::{Model, StorageError, StrataResult};

    struct BrokenLayer;

    fn broken() -> strata_core::StrataError {
        StorageError::Backend {
            backend: "broken".to_string(),
            reason: "disk on fire".to_string(),
        }
        .into()
    }

    #[async_trait]
    impl CacheLayer for BrokenLayer {
        fn name(&self) -> &str {
            "broken"
        }
        async fn fetch(&self, _request: Arc<RequestOp>) -> StrataResult<OpResponse> {
            Err(broken())
        }
        async fn store(
            &self,
            _model_type: &str,
            _id: &ModelId,
            _model: Option<Arc<Model>>,
            _arrived_at_ms: TimeMs,
            _etag: Option<&str>,
        ) -> StrataResult<()> {
            Err(broken())
        }
        async fn store_collection(&self, _: &str, _: &str, _: &[ModelId], _: TimeMs) -> StrataResult<()> {
            Err(broken())
        }
        async fn store_blob(&self, _: &str, _: Option<Arc<Vec<u8>>>, _: TimeMs, _: Option<&str>) -> StrataResult<()> {
            Err(broken())
        }
        async fn clear_all(&self, _: Option<&HoldRegistry>, _: Option<TimeMs>) -> StrataResult<u64> {
            Err(broken())
        }
        async fn entry_count(&self) -> StrataResult<u64> {
            Err(broken())
        }
    }

    #[tokio::test]
    async fn test_failures_read_as_misses() {
        let guarded = GuardedLayer::new(Arc::new(BrokenLayer), 1);
        let request = Arc::new(RequestOp::get("Person", 1));
        let response = guarded.fetch(request.clone()).await;
        assert!(!response.exists);
        assert_eq!(response.layer, LayerIndex::Cache(1));

        let found = OpResponse::found(
            request,
            strata_core::OpResult::Model(Arc::new(Model::new("Person").with_id(1))),
            1,
            "origin",
            LayerIndex::Origin,
        );
        guarded.store_response(&found).await;
        assert_eq!(guarded.clear_all(None, None).await, 0);

        let stats = guarded.stats().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.stores, 0);
        assert_eq!(stats.errors, 4);
    }

    #[tokio::test]
    async fn test_hits_are_relabelled() {
        let memory = Arc::new(MemoryLayer::new("hot"));
        let guarded = GuardedLayer::new(memory, 2);
        let request = Arc::new(RequestOp::get("Person", 1));
        let found = OpResponse::found(
            request.clone(),
            strata_core::OpResult::Model(Arc::new(Model::new("Person").with_id(1))),
            1,
            "origin",
            LayerIndex::Origin,
        );
        guarded.store_response(&found).await;

        let response = guarded.fetch(request).await;
        assert!(response.exists);
        assert_eq!(response.layer, LayerIndex::Cache(2));
        assert_eq!(response.source_name, "hot");
        assert_eq!(guarded.stats().await.hit_rate(), 1.0);
    }
}
