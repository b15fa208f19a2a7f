//! In-process cache layer.
//!
//! Stores the `Arc`s it is given and hands the same instances back, so
//! two reads of one record served from this layer are pointer-equal.
//! Re-storing an equal value keeps the existing instance and refreshes
//! only its arrival stamp.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use strata_core::{
    LayerIndex, Model, ModelId, OpResponse, OpResult, RequestOp, StorageError, StrataResult, TimeMs,
    Verb,
};

use super::key::CacheKey;
use super::traits::CacheLayer;
use crate::hold::HoldRegistry;

#[derive(Debug, Clone)]
struct Stamped<T> {
    value: T,
    arrived_at_ms: TimeMs,
    etag: Option<String>,
}

#[derive(Debug, Default)]
struct Entries {
    records: HashMap<(String, ModelId), Stamped<Arc<Model>>>,
    collections: HashMap<(String, String), Stamped<Vec<ModelId>>>,
    blobs: HashMap<String, Stamped<Arc<Vec<u8>>>>,
}

impl Entries {
    fn stamps(&self) -> Vec<(CacheKey, TimeMs)> {
        let records = self
            .records
            .iter()
            .map(|((t, id), e)| (CacheKey::record(t.clone(), id.clone()), e.arrived_at_ms));
        let collections = self
            .collections
            .iter()
            .map(|((t, name), e)| (CacheKey::collection(t.clone(), name.clone()), e.arrived_at_ms));
        let blobs = self
            .blobs
            .iter()
            .map(|(path, e)| (CacheKey::blob(path.clone()), e.arrived_at_ms));
        records.chain(collections).chain(blobs).collect()
    }

    fn remove(&mut self, key: &CacheKey) -> bool {
        match key {
            CacheKey::Record { model_type, id } => {
                self.records.remove(&(model_type.clone(), id.clone())).is_some()
            }
            CacheKey::Collection { model_type, name } => self
                .collections
                .remove(&(model_type.clone(), name.clone()))
                .is_some(),
            CacheKey::Blob { path } => self.blobs.remove(path).is_some(),
        }
    }

    fn len(&self) -> usize {
        self.records.len() + self.collections.len() + self.blobs.len()
    }
}

/// Cache layer backed by in-process hash maps.
#[derive(Debug)]
pub struct MemoryLayer {
    name: String,
    entries: RwLock<Entries>,
}

impl MemoryLayer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(Entries::default()),
        }
    }

    fn read(&self) -> StrataResult<RwLockReadGuard<'_, Entries>> {
        self.entries.read().map_err(|_| StorageError::LockPoisoned.into())
    }

    fn write(&self) -> StrataResult<RwLockWriteGuard<'_, Entries>> {
        self.entries.write().map_err(|_| StorageError::LockPoisoned.into())
    }
}

impl Default for MemoryLayer {
    fn default() -> Self {
        Self::new("memory")
    }
}

/// True when `key` is pinned.
pub(crate) async fn is_held(holds: &HoldRegistry, key: &CacheKey) -> StrataResult<bool> {
    match key {
        CacheKey::Record { model_type, id } => holds.is_held(model_type, id).await,
        CacheKey::Collection { model_type, name } => holds.is_collection_held(model_type, name).await,
        CacheKey::Blob { path } => holds.is_blob_held(path).await,
    }
}

/// Keys among `stamps` that a clear should remove.
pub(crate) async fn clearable(
    stamps: Vec<(CacheKey, TimeMs)>,
    holds: Option<&HoldRegistry>,
    older_than: Option<TimeMs>,
) -> StrataResult<Vec<CacheKey>> {
    let mut doomed = Vec::new();
    for (key, arrived_at_ms) in stamps {
        if older_than.is_some_and(|cutoff| arrived_at_ms >= cutoff) {
            continue;
        }
        if let Some(holds) = holds {
            if is_held(holds, &key).await? {
                continue;
            }
        }
        doomed.push(key);
    }
    Ok(doomed)
}

#[async_trait]
impl CacheLayer for MemoryLayer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, request: Arc<RequestOp>) -> StrataResult<OpResponse> {
        let found = {
            let entries = self.read()?;
            let model_type = request.model_type.clone();
            match request.verb {
                Verb::Get => request.id.as_ref().and_then(|id| {
                    entries.records.get(&(model_type, id.clone())).map(|e| {
                        (OpResult::Model(e.value.clone()), e.arrived_at_ms, e.etag.clone())
                    })
                }),
                Verb::Query | Verb::GetCollection => request.collection_key.as_ref().and_then(|name| {
                    let collection = entries.collections.get(&(model_type.clone(), name.clone()))?;
                    let result = if request.verb == Verb::GetCollection {
                        OpResult::Ids(collection.value.clone())
                    } else {
                        let models = collection
                            .value
                            .iter()
                            .map(|id| {
                                entries
                                    .records
                                    .get(&(model_type.clone(), id.clone()))
                                    .map(|e| e.value.clone())
                            })
                            .collect::<Option<Vec<_>>>()?;
                        OpResult::Models(models)
                    };
                    Some((result, collection.arrived_at_ms, None))
                }),
                Verb::BlobGet => request.path.as_ref().and_then(|path| {
                    entries
                        .blobs
                        .get(path)
                        .map(|e| (OpResult::Bytes(e.value.clone()), e.arrived_at_ms, e.etag.clone()))
                }),
                _ => None,
            }
        };

        Ok(match found {
            Some((result, arrived_at_ms, etag)) => {
                OpResponse::found(request, result, arrived_at_ms, &self.name, LayerIndex::Cache(0))
                    .with_etag(etag)
            }
            None => OpResponse::missing(request, &self.name, LayerIndex::Cache(0)),
        })
    }

    async fn store(
        &self,
        model_type: &str,
        id: &ModelId,
        model: Option<Arc<Model>>,
        arrived_at_ms: TimeMs,
        etag: Option<&str>,
    ) -> StrataResult<()> {
        let mut entries = self.write()?;
        let key = (model_type.to_string(), id.clone());
        let Some(model) = model else {
            entries.records.remove(&key);
            return Ok(());
        };
        let etag = etag.map(str::to_string);
        match entries.records.get_mut(&key) {
            Some(existing) if *existing.value == *model => {
                existing.arrived_at_ms = arrived_at_ms;
                existing.etag = etag;
            }
            _ => {
                entries.records.insert(
                    key,
                    Stamped {
                        value: model,
                        arrived_at_ms,
                        etag,
                    },
                );
            }
        }
        Ok(())
    }

    async fn store_collection(
        &self,
        model_type: &str,
        name: &str,
        ids: &[ModelId],
        arrived_at_ms: TimeMs,
    ) -> StrataResult<()> {
        self.write()?.collections.insert(
            (model_type.to_string(), name.to_string()),
            Stamped {
                value: ids.to_vec(),
                arrived_at_ms,
                etag: None,
            },
        );
        Ok(())
    }

    async fn store_blob(
        &self,
        path: &str,
        bytes: Option<Arc<Vec<u8>>>,
        arrived_at_ms: TimeMs,
        etag: Option<&str>,
    ) -> StrataResult<()> {
        let mut entries = self.write()?;
        let Some(bytes) = bytes else {
            entries.blobs.remove(path);
            return Ok(());
        };
        let etag = etag.map(str::to_string);
        match entries.blobs.get_mut(path) {
            Some(existing) if existing.value == bytes => {
                existing.arrived_at_ms = arrived_at_ms;
                existing.etag = etag;
            }
            _ => {
                entries.blobs.insert(
                    path.to_string(),
                    Stamped {
                        value: bytes,
                        arrived_at_ms,
                        etag,
                    },
                );
            }
        }
        Ok(())
    }

    async fn clear_all(&self, holds: Option<&HoldRegistry>, older_than: Option<TimeMs>) -> StrataResult<u64> {
        let stamps = self.read()?.stamps();
        let doomed = clearable(stamps, holds, older_than).await?;

        let mut entries = self.write()?;
        let removed = doomed.iter().filter(|key| entries.remove(key)).count();
        tracing::debug!(layer = %self.name, removed, "cleared memory layer");
        Ok(removed as u64)
    }

    async fn entry_count(&self) -> StrataResult<u64> {
        Ok(self.read()?.len() as u64)
    }
}
