//! Hold registry.
//!
//! A hold pins a cached record, collection or blob against `clear_all`.
//! Holds are empty marker files under three namespaces:
//!
//! ```text
//! <root>/models/<type>/<id>
//! <root>/collections/<type>/<name>
//! <root>/blobs/<path>
//! ```
//!
//! Presence is the signal. The file's modification time is the hold time
//! used by age-bounded release. Every name is escaped through
//! [`encode_segment`] so arbitrary ids and paths map onto single files.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use strata_core::{ModelId, StorageError, StrataError, StrataResult, TimeMs};
use tokio::fs;

use crate::cache::key::{decode_id, decode_segment, encode_id, encode_segment};

const MODELS: &str = "models";
const COLLECTIONS: &str = "collections";
const BLOBS: &str = "blobs";

/// Which holds [`HoldRegistry::unhold_all`] releases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HoldScope {
    /// Every namespace.
    All,
    /// Model holds, optionally for one type.
    Models(Option<String>),
    /// Collection holds, optionally for one type.
    Collections(Option<String>),
    Blobs,
}

/// File-backed set of held keys.
#[derive(Debug, Clone)]
pub struct HoldRegistry {
    root: PathBuf,
}

impl HoldRegistry {
    /// Open (creating if needed) the registry rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> StrataResult<Self> {
        let root = root.as_ref().to_path_buf();
        for namespace in [MODELS, COLLECTIONS, BLOBS] {
            let dir = root.join(namespace);
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| StrataError::io(&dir, e))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn model_path(&self, model_type: &str, id: &ModelId) -> PathBuf {
        self.root
            .join(MODELS)
            .join(encode_segment(model_type))
            .join(encode_id(id))
    }

    fn collection_path(&self, model_type: &str, name: &str) -> PathBuf {
        self.root
            .join(COLLECTIONS)
            .join(encode_segment(model_type))
            .join(encode_segment(name))
    }

    fn blob_path(&self, path: &str) -> PathBuf {
        self.root.join(BLOBS).join(encode_segment(path))
    }

    // === Models ===

    pub async fn hold(&self, model_type: &str, id: &ModelId) -> StrataResult<()> {
        touch(&self.model_path(model_type, id)).await
    }

    pub async fn unhold(&self, model_type: &str, id: &ModelId) -> StrataResult<()> {
        remove(&self.model_path(model_type, id)).await.map(|_| ())
    }

    pub async fn is_held(&self, model_type: &str, id: &ModelId) -> StrataResult<bool> {
        exists(&self.model_path(model_type, id)).await
    }

    /// Held ids of `model_type`, sorted by their text form.
    pub async fn list_held_ids(&self, model_type: &str) -> StrataResult<Vec<ModelId>> {
        let dir = self.root.join(MODELS).join(encode_segment(model_type));
        let mut ids: Vec<ModelId> = list_names(&dir)
            .await?
            .iter()
            .filter_map(|name| decode_id(name))
            .collect();
        ids.sort_by_key(|id| id.to_string());
        Ok(ids)
    }

    // === Collections ===

    pub async fn hold_collection(&self, model_type: &str, name: &str) -> StrataResult<()> {
        touch(&self.collection_path(model_type, name)).await
    }

    pub async fn unhold_collection(&self, model_type: &str, name: &str) -> StrataResult<()> {
        remove(&self.collection_path(model_type, name)).await.map(|_| ())
    }

    pub async fn is_collection_held(&self, model_type: &str, name: &str) -> StrataResult<bool> {
        exists(&self.collection_path(model_type, name)).await
    }

    pub async fn list_held_collections(&self, model_type: &str) -> StrataResult<Vec<String>> {
        let dir = self.root.join(COLLECTIONS).join(encode_segment(model_type));
        decoded_sorted(list_names(&dir).await?)
    }

    // === Blobs ===

    pub async fn hold_blob(&self, path: &str) -> StrataResult<()> {
        touch(&self.blob_path(path)).await
    }

    pub async fn unhold_blob(&self, path: &str) -> StrataResult<()> {
        remove(&self.blob_path(path)).await.map(|_| ())
    }

    pub async fn is_blob_held(&self, path: &str) -> StrataResult<bool> {
        exists(&self.blob_path(path)).await
    }

    pub async fn list_held_blobs(&self) -> StrataResult<Vec<String>> {
        decoded_sorted(list_names(&self.root.join(BLOBS)).await?)
    }

    // === Release ===

    /// Release holds in `scope`. With `older_than`, only holds placed
    /// before that time are released. Returns the number released.
    pub async fn unhold_all(&self, scope: HoldScope, older_than: Option<TimeMs>) -> StrataResult<u64> {
        let mut dirs = Vec::new();
        let typed = |namespace: &str, model_type: &Option<String>| -> Vec<PathBuf> {
            let base = self.root.join(namespace);
            match model_type {
                Some(t) => vec![base.join(encode_segment(t))],
                None => vec![base],
            }
        };
        match &scope {
            HoldScope::All => {
                dirs.extend(typed(MODELS, &None));
                dirs.extend(typed(COLLECTIONS, &None));
                dirs.push(self.root.join(BLOBS));
            }
            HoldScope::Models(t) => dirs.extend(typed(MODELS, t)),
            HoldScope::Collections(t) => dirs.extend(typed(COLLECTIONS, t)),
            HoldScope::Blobs => dirs.push(self.root.join(BLOBS)),
        }

        let mut released = 0;
        for dir in dirs {
            released += release_tree(&dir, older_than).await?;
        }
        tracing::debug!(?scope, ?older_than, released, "released holds");
        Ok(released)
    }
}

// ============================================================================
// FILE HELPERS
// ============================================================================

async fn touch(path: &Path) -> StrataResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StrataError::io(parent, e))?;
    }
    fs::write(path, b"").await.map_err(|e| StrataError::io(path, e))
}

/// Remove a file, treating absence as success. Returns whether it existed.
async fn remove(path: &Path) -> StrataResult<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StrataError::io(path, e)),
    }
}

async fn exists(path: &Path) -> StrataResult<bool> {
    fs::try_exists(path).await.map_err(|e| StrataError::io(path, e))
}

/// File names directly under `dir`. A missing directory is empty.
async fn list_names(dir: &Path) -> StrataResult<Vec<String>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StrataError::io(dir, e)),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| StrataError::io(dir, e))? {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

fn decoded_sorted(names: Vec<String>) -> StrataResult<Vec<String>> {
    let mut decoded = names
        .iter()
        .map(|name| {
            decode_segment(name).ok_or_else(|| {
                StorageError::Backend {
                    backend: "hold".to_string(),
                    reason: format!("undecodable hold marker {}", name),
                }
                .into()
            })
        })
        .collect::<StrataResult<Vec<String>>>()?;
    decoded.sort();
    Ok(decoded)
}

fn modified_ms(metadata: &std::fs::Metadata) -> Option<TimeMs> {
    metadata
        .modified()
        .ok()
        .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
}

/// Remove marker files under `dir` (one level of type subdirectories).
async fn release_tree(dir: &Path, older_than: Option<TimeMs>) -> StrataResult<u64> {
    let mut released = 0;
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for name in list_names(&current).await? {
            let path = current.join(&name);
            let metadata = fs::metadata(&path)
                .await
                .map_err(|e| StrataError::io(&path, e))?;
            if metadata.is_dir() {
                pending.push(path);
                continue;
            }
            let expired = match older_than {
                Some(cutoff) => modified_ms(&metadata).is_some_and(|t| t < cutoff),
                None => true,
            };
            if expired && remove(&path).await? {
                released += 1;
            }
        }
    }
    Ok(released)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn registry() -> (HoldRegistry, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let holds = HoldRegistry::open(dir.path()).await.expect("open");
        (holds, dir)
    }

    #[tokio::test]
    async fn test_hold_and_unhold_model() {
        let (holds, _dir) = registry().await;
        let id = ModelId::Int(7);

        assert!(!holds.is_held("Person", &id).await.unwrap());
        holds.hold("Person", &id).await.unwrap();
        assert!(holds.is_held("Person", &id).await.unwrap());
        assert!(!holds.is_held("Pet", &id).await.unwrap());

        holds.unhold("Person", &id).await.unwrap();
        assert!(!holds.is_held("Person", &id).await.unwrap());
        // Releasing twice is fine.
        holds.unhold("Person", &id).await.unwrap();
    }

    #[tokio::test]
    async fn test_lists_are_sorted_and_decoded() {
        let (holds, _dir) = registry().await;
        for id in [ModelId::from("b/2"), ModelId::from("a"), ModelId::Int(10)] {
            holds.hold("Doc", &id).await.unwrap();
        }
        let ids = holds.list_held_ids("Doc").await.unwrap();
        assert_eq!(ids, vec![ModelId::Int(10), ModelId::from("a"), ModelId::from("b/2")]);

        holds.hold_blob("photos/z.png").await.unwrap();
        holds.hold_blob("photos/a.png").await.unwrap();
        assert_eq!(
            holds.list_held_blobs().await.unwrap(),
            vec!["photos/a.png".to_string(), "photos/z.png".to_string()]
        );

        assert!(holds.list_held_collections("Nothing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unhold_all_scopes() {
        let (holds, _dir) = registry().await;
        holds.hold("Person", &ModelId::Int(1)).await.unwrap();
        holds.hold("Pet", &ModelId::Int(1)).await.unwrap();
        holds.hold_collection("Person", "all").await.unwrap();
        holds.hold_blob("x").await.unwrap();

        let released = holds
            .unhold_all(HoldScope::Models(Some("Person".to_string())), None)
            .await
            .unwrap();
        assert_eq!(released, 1);
        assert!(holds.is_held("Pet", &ModelId::Int(1)).await.unwrap());

        let released = holds.unhold_all(HoldScope::All, None).await.unwrap();
        assert_eq!(released, 3);
        assert!(!holds.is_collection_held("Person", "all").await.unwrap());
        assert!(!holds.is_blob_held("x").await.unwrap());
    }

    #[tokio::test]
    async fn test_unhold_all_respects_cutoff() {
        let (holds, _dir) = registry().await;
        holds.hold("Person", &ModelId::Int(1)).await.unwrap();

        // Nothing was held before the epoch.
        assert_eq!(holds.unhold_all(HoldScope::All, Some(0)).await.unwrap(), 0);
        assert!(holds.is_held("Person", &ModelId::Int(1)).await.unwrap());

        let future = strata_core::now_ms() + 60_000;
        assert_eq!(holds.unhold_all(HoldScope::All, Some(future)).await.unwrap(), 1);
    }
}
