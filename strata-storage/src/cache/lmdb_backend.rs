//! LMDB-backed cache layer.
//!
//! Uses the heed crate (Rust bindings for LMDB) for a persistent,
//! memory-mapped tier that survives restarts.
//!
//! # Layout
//!
//! Every entry is two keys in one database:
//! - the value under [`CacheKey::encode`]: JSON for records and
//!   collections, raw bytes for blobs
//! - the arrival stamp under [`CacheKey::stamp_key`]
//!
//! Re-storing identical content rewrites only the stamp, so refreshing an
//! unchanged record never touches its value page.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn};
use serde::{Deserialize, Serialize};
use strata_core::{
    LayerIndex, Model, ModelId, OpResponse, OpResult, RequestOp, StorageError, StrataError, StrataResult,
    TimeMs, Verb,
};

use super::key::CacheKey;
use super::memory_backend::clearable;
use super::traits::CacheLayer;
use crate::hold::HoldRegistry;

/// Error type for LMDB layer operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbLayerError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Stored bytes did not decode.
    #[error("Corrupt entry: {0}")]
    Corrupt(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbLayerError> for StrataError {
    fn from(e: LmdbLayerError) -> Self {
        StorageError::Backend {
            backend: "lmdb".to_string(),
            reason: e.to_string(),
        }
        .into()
    }
}

fn txn_error(e: heed::Error) -> LmdbLayerError {
    LmdbLayerError::Transaction(e.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Stamp {
    arrived_at_ms: TimeMs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    etag: Option<String>,
}

/// Persistent cache layer.
pub struct LmdbLayer {
    name: String,
    env: Env,
    db: Database<Bytes, Bytes>,
    /// Value pages written, excluding stamp-only refreshes.
    value_writes: AtomicU64,
}

impl LmdbLayer {
    /// Open (creating if needed) an LMDB layer.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    pub fn open<P: AsRef<Path>>(name: impl Into<String>, path: P, max_size_mb: usize) -> Result<Self, LmdbLayerError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbLayerError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_error)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbLayerError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_error)?;

        Ok(Self {
            name: name.into(),
            env,
            db,
            value_writes: AtomicU64::new(0),
        })
    }

    /// Number of value writes since open.
    pub fn value_writes(&self) -> u64 {
        self.value_writes.load(Ordering::Relaxed)
    }

    fn get_entry(&self, rtxn: &RoTxn<'_>, key: &CacheKey) -> Result<Option<(Vec<u8>, Stamp)>, LmdbLayerError> {
        let Some(value) = self.db.get(rtxn, &key.encode()).map_err(txn_error)? else {
            return Ok(None);
        };
        let stamp = match self.db.get(rtxn, &key.stamp_key()).map_err(txn_error)? {
            Some(raw) => serde_json::from_slice(raw).map_err(|e| LmdbLayerError::Corrupt(e.to_string()))?,
            // A value without a stamp is as old as possible.
            None => Stamp {
                arrived_at_ms: 0,
                etag: None,
            },
        };
        Ok(Some((value.to_vec(), stamp)))
    }

    fn get_model(&self, rtxn: &RoTxn<'_>, key: &CacheKey) -> Result<Option<(Arc<Model>, Stamp)>, LmdbLayerError> {
        match self.get_entry(rtxn, key)? {
            Some((bytes, stamp)) => {
                let model: Model =
                    serde_json::from_slice(&bytes).map_err(|e| LmdbLayerError::Corrupt(e.to_string()))?;
                Ok(Some((Arc::new(model), stamp)))
            }
            None => Ok(None),
        }
    }

    /// Write `value` (skipped when unchanged) and always refresh its stamp.
    fn put_entry(&self, key: &CacheKey, value: &[u8], stamp: &Stamp) -> Result<(), LmdbLayerError> {
        let encoded = key.encode();
        let stamp_bytes = serde_json::to_vec(stamp).map_err(|e| LmdbLayerError::Corrupt(e.to_string()))?;

        let unchanged = {
            let rtxn = self.env.read_txn().map_err(txn_error)?;
            self.db.get(&rtxn, &encoded).map_err(txn_error)? == Some(value)
        };

        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        if !unchanged {
            self.db.put(&mut wtxn, &encoded, value).map_err(txn_error)?;
        }
        self.db
            .put(&mut wtxn, &key.stamp_key(), &stamp_bytes)
            .map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)?;

        if !unchanged {
            self.value_writes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn delete_entries(&self, keys: &[CacheKey]) -> Result<u64, LmdbLayerError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let mut deleted = 0u64;
        for key in keys {
            if self.db.delete(&mut wtxn, &key.encode()).map_err(txn_error)? {
                deleted += 1;
            }
            self.db.delete(&mut wtxn, &key.stamp_key()).map_err(txn_error)?;
        }
        wtxn.commit().map_err(txn_error)?;
        Ok(deleted)
    }

    /// Every entry key with its arrival time.
    fn collect_stamps(&self) -> Result<Vec<(CacheKey, TimeMs)>, LmdbLayerError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        let mut keys = Vec::new();
        for result in self.db.iter(&rtxn).map_err(txn_error)? {
            let (raw, _) = result.map_err(txn_error)?;
            if CacheKey::is_stamp(raw) {
                continue;
            }
            if let Some(key) = CacheKey::decode(raw) {
                keys.push(key);
            }
        }

        let mut stamps = Vec::with_capacity(keys.len());
        for key in keys {
            let arrived = match self.db.get(&rtxn, &key.stamp_key()).map_err(txn_error)? {
                Some(raw) => serde_json::from_slice::<Stamp>(raw)
                    .map(|s| s.arrived_at_ms)
                    .unwrap_or(0),
                None => 0,
            };
            stamps.push((key, arrived));
        }
        Ok(stamps)
    }

    fn lookup(&self, request: &RequestOp) -> Result<Option<(OpResult, Stamp)>, LmdbLayerError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        let model_type = &request.model_type;

        match request.verb {
            Verb::Get => {
                let Some(id) = &request.id else {
                    return Ok(None);
                };
                Ok(self
                    .get_model(&rtxn, &CacheKey::record(model_type.clone(), id.clone()))?
                    .map(|(model, stamp)| (OpResult::Model(model), stamp)))
            }
            Verb::Query | Verb::GetCollection => {
                let Some(name) = &request.collection_key else {
                    return Ok(None);
                };
                let key = CacheKey::collection(model_type.clone(), name.clone());
                let Some((bytes, stamp)) = self.get_entry(&rtxn, &key)? else {
                    return Ok(None);
                };
                let ids: Vec<ModelId> =
                    serde_json::from_slice(&bytes).map_err(|e| LmdbLayerError::Corrupt(e.to_string()))?;
                if request.verb == Verb::GetCollection {
                    return Ok(Some((OpResult::Ids(ids), stamp)));
                }
                let mut models = Vec::with_capacity(ids.len());
                for id in ids {
                    match self.get_model(&rtxn, &CacheKey::record(model_type.clone(), id))? {
                        Some((model, _)) => models.push(model),
                        None => return Ok(None),
                    }
                }
                Ok(Some((OpResult::Models(models), Stamp { etag: None, ..stamp })))
            }
            Verb::BlobGet => {
                let Some(path) = &request.path else {
                    return Ok(None);
                };
                Ok(self
                    .get_entry(&rtxn, &CacheKey::blob(path.clone()))?
                    .map(|(bytes, stamp)| (OpResult::Bytes(Arc::new(bytes)), stamp)))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl CacheLayer for LmdbLayer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, request: Arc<RequestOp>) -> StrataResult<OpResponse> {
        let found = self.lookup(&request)?;
        Ok(match found {
            Some((result, stamp)) => {
                OpResponse::found(request, result, stamp.arrived_at_ms, &self.name, LayerIndex::Cache(0))
                    .with_etag(stamp.etag)
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
        let key = CacheKey::record(model_type, id.clone());
        match model {
            Some(model) => {
                let bytes = serde_json::to_vec(&*model).map_err(StrataError::serialization)?;
                let stamp = Stamp {
                    arrived_at_ms,
                    etag: etag.map(str::to_string),
                };
                self.put_entry(&key, &bytes, &stamp)?;
            }
            None => {
                self.delete_entries(&[key])?;
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
        let bytes = serde_json::to_vec(ids).map_err(StrataError::serialization)?;
        let stamp = Stamp {
            arrived_at_ms,
            etag: None,
        };
        self.put_entry(&CacheKey::collection(model_type, name), &bytes, &stamp)?;
        Ok(())
    }

    async fn store_blob(
        &self,
        path: &str,
        bytes: Option<Arc<Vec<u8>>>,
        arrived_at_ms: TimeMs,
        etag: Option<&str>,
    ) -> StrataResult<()> {
        let key = CacheKey::blob(path);
        match bytes {
            Some(bytes) => {
                let stamp = Stamp {
                    arrived_at_ms,
                    etag: etag.map(str::to_string),
                };
                self.put_entry(&key, &bytes, &stamp)?;
            }
            None => {
                self.delete_entries(&[key])?;
            }
        }
        Ok(())
    }

    async fn clear_all(&self, holds: Option<&HoldRegistry>, older_than: Option<TimeMs>) -> StrataResult<u64> {
        let stamps = self.collect_stamps()?;
        let doomed = clearable(stamps, holds, older_than).await?;
        let removed = self.delete_entries(&doomed)?;
        tracing::debug!(layer = %self.name, removed, "cleared lmdb layer");
        Ok(removed)
    }

    async fn entry_count(&self) -> StrataResult<u64> {
        Ok(self.collect_stamps()?.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_layer() -> (LmdbLayer, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let layer = LmdbLayer::open("disk", temp_dir.path(), 10).expect("Failed to open layer");
        (layer, temp_dir)
    }

    fn person(id: i64, name: &str) -> Arc<Model> {
        Arc::new(Model::new("Person").with_id(id).with("name", name))
    }

    #[tokio::test]
    async fn test_store_and_fetch_record() {
        let (layer, _temp_dir) = create_test_layer();
        layer
            .store("Person", &ModelId::Int(1), Some(person(1, "ada")), 1_000, Some("e1"))
            .await
            .unwrap();

        let response = layer.fetch(Arc::new(RequestOp::get("Person", 1))).await.unwrap();
        assert!(response.exists);
        assert_eq!(response.arrived_at_ms, 1_000);
        assert_eq!(response.etag.as_deref(), Some("e1"));
        assert_eq!(*response.first_result().unwrap(), *person(1, "ada"));
    }

    #[tokio::test]
    async fn test_fetch_missing() {
        let (layer, _temp_dir) = create_test_layer();
        let response = layer.fetch(Arc::new(RequestOp::get("Person", 404))).await.unwrap();
        assert!(!response.exists);
        assert!(response.connected);
    }

    #[tokio::test]
    async fn test_identical_restore_only_refreshes_stamp() {
        let (layer, _temp_dir) = create_test_layer();
        let id = ModelId::Int(1);
        layer.store("Person", &id, Some(person(1, "ada")), 1, None).await.unwrap();
        layer.store("Person", &id, Some(person(1, "ada")), 2, None).await.unwrap();
        assert_eq!(layer.value_writes(), 1);

        let response = layer.fetch(Arc::new(RequestOp::get("Person", 1))).await.unwrap();
        assert_eq!(response.arrived_at_ms, 2);

        layer.store("Person", &id, Some(person(1, "grace")), 3, None).await.unwrap();
        assert_eq!(layer.value_writes(), 2);
    }

    #[tokio::test]
    async fn test_collection_and_blob() {
        let (layer, _temp_dir) = create_test_layer();
        let ids = vec![ModelId::Int(2), ModelId::from("x")];
        layer.store_collection("Person", "mixed", &ids, 5).await.unwrap();
        let response = layer
            .fetch(Arc::new(RequestOp::get_collection("Person", "mixed")))
            .await
            .unwrap();
        assert_eq!(response.result_ids(), ids);

        layer
            .store_blob("photos/1.png", Some(Arc::new(vec![9, 8, 7])), 6, Some("b1"))
            .await
            .unwrap();
        let response = layer.fetch(Arc::new(RequestOp::blob_get("photos/1.png"))).await.unwrap();
        assert_eq!(response.bytes().map(|b| b.as_slice()), Some(&[9u8, 8, 7][..]));

        layer.store_blob("photos/1.png", None, 7, None).await.unwrap();
        assert_eq!(layer.entry_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let layer = LmdbLayer::open("disk", temp_dir.path(), 10).unwrap();
            layer
                .store("Person", &ModelId::Int(1), Some(person(1, "ada")), 10, None)
                .await
                .unwrap();
        }
        let layer = LmdbLayer::open("disk", temp_dir.path(), 10).unwrap();
        let response = layer.fetch(Arc::new(RequestOp::get("Person", 1))).await.unwrap();
        assert!(response.exists);
    }

    #[tokio::test]
    async fn test_clear_all_keeps_holds() {
        let (layer, temp_dir) = create_test_layer();
        let holds = HoldRegistry::open(temp_dir.path().join("holds")).await.unwrap();
        for id in 1..=2 {
            layer
                .store("Person", &ModelId::Int(id), Some(person(id, "x")), 1, None)
                .await
                .unwrap();
        }
        holds.hold("Person", &ModelId::Int(2)).await.unwrap();

        assert_eq!(layer.clear_all(Some(&holds), None).await.unwrap(), 1);
        let kept = layer.fetch(Arc::new(RequestOp::get("Person", 2))).await.unwrap();
        assert!(kept.exists);
    }
}
