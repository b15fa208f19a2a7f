//! Offline pending-change queue.
//!
//! Each write accepted while offline becomes one JSON envelope in the
//! pending directory. File names are the zero-padded request time, so a
//! plain lexicographic listing is replay order. Binary payloads are
//! externalized to sibling attachment files:
//!
//! ```text
//! 0001718000000000.json
//! 0001718000000001.json
//! 0001718000000001__Value.bin
//! ```
//!
//! # Crash Safety
//!
//! - Attachments are written before their envelope, and every file is
//!   written to a temporary name and renamed into place.
//! - Removal deletes the envelope first, then its attachments.
//! - [`PendingQueue::open`] sweeps temporaries and attachments whose
//!   envelope is gone.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_core::{
    ChangeSet, Model, ModelId, QueueError, RequestOp, RequestValue, StrataError, StrataResult, TimeMs, Verb,
};
use tokio::fs;
use tokio::sync::Mutex;

/// Width of the numeric file stem.
const STEM_DIGITS: usize = 16;
const ENVELOPE_EXT: &str = ".json";
const ATTACHMENT_EXT: &str = ".bin";
const TEMP_EXT: &str = ".tmp";
const ATTACHMENT_SEP: &str = "__";
/// Envelope field externalized for byte payloads.
const VALUE_FIELD: &str = "Value";

/// On-disk form of one pending change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Envelope {
    verb: Verb,
    #[serde(rename = "Type")]
    model_type: String,
    #[serde(default)]
    id: Option<ModelId>,
    time_ms: TimeMs,
    #[serde(default)]
    value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    criteria: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    extra: Option<Model>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    action: Option<String>,
    /// Field name to attachment file name.
    #[serde(rename = "externals", default, skip_serializing_if = "BTreeMap::is_empty")]
    externals: BTreeMap<String, String>,
}

/// A queued change as read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub file_name: String,
    pub request: RequestOp,
}

fn envelope_name(number: u64) -> String {
    format!("{:0width$}{}", number, ENVELOPE_EXT, width = STEM_DIGITS)
}

fn attachment_name(number: u64, field: &str) -> String {
    format!(
        "{:0width$}{}{}{}",
        number,
        ATTACHMENT_SEP,
        field,
        ATTACHMENT_EXT,
        width = STEM_DIGITS
    )
}

/// Parse the number of an envelope file name.
fn envelope_number(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(ENVELOPE_EXT)?;
    if stem.len() != STEM_DIGITS || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Parse the owning envelope number of an attachment file name.
fn attachment_owner(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(ATTACHMENT_EXT)?;
    let (number, _) = stem.split_once(ATTACHMENT_SEP)?;
    if number.len() != STEM_DIGITS {
        return None;
    }
    number.parse().ok()
}

fn corrupt(file: &str, reason: impl ToString) -> StrataError {
    QueueError::CorruptRecord {
        file: file.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Ordered, file-backed queue of offline writes.
#[derive(Debug)]
pub struct PendingQueue {
    dir: PathBuf,
    /// Highest envelope number handed out or found on disk.
    last: Mutex<Option<u64>>,
}

impl PendingQueue {
    /// Open (creating if needed) the queue in `dir`, sweeping leftovers
    /// of interrupted writes and removals.
    pub async fn open(dir: impl AsRef<Path>) -> StrataResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StrataError::io(&dir, e))?;

        let names = list_names(&dir).await?;
        let envelopes: Vec<u64> = names.iter().filter_map(|n| envelope_number(n)).collect();

        let mut swept = 0;
        for name in &names {
            let orphan = name.ends_with(TEMP_EXT)
                || attachment_owner(name).is_some_and(|owner| !envelopes.contains(&owner));
            if orphan {
                remove_file(&dir.join(name)).await?;
                swept += 1;
            }
        }
        if swept > 0 {
            tracing::info!(dir = %dir.display(), swept, "swept orphaned pending files");
        }

        Ok(Self {
            dir,
            last: Mutex::new(envelopes.into_iter().max()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append `request`, returning its envelope file name.
    ///
    /// The file number is the request time, bumped past the last number
    /// handed out so same-millisecond writes keep their call order.
    pub async fn enqueue(&self, request: &RequestOp) -> StrataResult<String> {
        let mut last = self.last.lock().await;
        let floor = last.map_or(0, |n| n + 1);
        let mut number = (request.timestamp.max(0) as u64).max(floor);
        while exists(&self.dir.join(envelope_name(number))).await? {
            number += 1;
        }

        let name = self.write_envelope(number, request).await?;
        *last = Some(number);

        tracing::debug!(file = %name, verb = ?request.verb, model_type = %request.model_type, "queued pending change");
        Ok(name)
    }

    /// Overwrite a queued envelope in place, keeping its replay position.
    pub async fn rewrite(&self, file_name: &str, request: &RequestOp) -> StrataResult<()> {
        let number = envelope_number(file_name).ok_or_else(|| corrupt(file_name, "not an envelope file name"))?;
        self.write_envelope(number, request).await?;
        tracing::debug!(file = %file_name, verb = ?request.verb, "rewrote pending change");
        Ok(())
    }

    async fn write_envelope(&self, number: u64, request: &RequestOp) -> StrataResult<String> {
        let mut externals = BTreeMap::new();
        let value = match &request.value {
            RequestValue::None => Value::Null,
            RequestValue::Model(model) => serde_json::to_value(&**model).map_err(StrataError::serialization)?,
            RequestValue::Changes(changes) => serde_json::to_value(changes).map_err(StrataError::serialization)?,
            RequestValue::Params(params) => params.clone(),
            RequestValue::Bytes(bytes) => {
                let name = attachment_name(number, VALUE_FIELD);
                write_atomic(&self.dir.join(&name), bytes).await?;
                externals.insert(VALUE_FIELD.to_string(), name);
                Value::Null
            }
        };

        let envelope = Envelope {
            verb: request.verb,
            model_type: request.model_type.clone(),
            id: request.id.clone(),
            time_ms: request.timestamp,
            value,
            criteria: request.criteria.clone(),
            extra: request.extra.as_ref().map(|m| m.detached()),
            key: request.collection_key.clone(),
            path: request.path.clone(),
            action: request.action.clone(),
            externals,
        };
        let bytes = serde_json::to_vec_pretty(&envelope).map_err(StrataError::serialization)?;
        let name = envelope_name(number);
        write_atomic(&self.dir.join(&name), &bytes).await?;
        Ok(name)
    }

    /// Envelope file names in replay order.
    pub async fn list(&self) -> StrataResult<Vec<String>> {
        let mut names: Vec<String> = list_names(&self.dir)
            .await?
            .into_iter()
            .filter(|n| envelope_number(n).is_some())
            .collect();
        names.sort();
        Ok(names)
    }

    pub async fn len(&self) -> StrataResult<usize> {
        Ok(self.list().await?.len())
    }

    pub async fn is_empty(&self) -> StrataResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Read one envelope back into a request, inlining its attachments.
    pub async fn load(&self, file_name: &str) -> StrataResult<PendingChange> {
        let path = self.dir.join(file_name);
        let raw = fs::read(&path).await.map_err(|e| StrataError::io(&path, e))?;
        let envelope: Envelope = serde_json::from_slice(&raw).map_err(|e| corrupt(file_name, e))?;

        let value = match envelope.verb {
            // A destroy may target a bare id.
            Verb::Destroy if envelope.value.is_null() => RequestValue::None,
            Verb::Create | Verb::Replace | Verb::Destroy => {
                let model: Model = serde_json::from_value(envelope.value).map_err(|e| corrupt(file_name, e))?;
                RequestValue::Model(Arc::new(model))
            }
            Verb::Update => {
                let changes: ChangeSet =
                    serde_json::from_value(envelope.value).map_err(|e| corrupt(file_name, e))?;
                RequestValue::Changes(changes)
            }
            Verb::Execute => RequestValue::Params(envelope.value),
            Verb::BlobPut => {
                let attachment = envelope.externals.get(VALUE_FIELD).ok_or_else(|| {
                    StrataError::from(QueueError::MissingAttachment {
                        file: file_name.to_string(),
                        attachment: VALUE_FIELD.to_string(),
                    })
                })?;
                let bytes = match fs::read(self.dir.join(attachment)).await {
                    Ok(bytes) => bytes,
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        return Err(QueueError::MissingAttachment {
                            file: file_name.to_string(),
                            attachment: attachment.clone(),
                        }
                        .into())
                    }
                    Err(e) => return Err(StrataError::io(self.dir.join(attachment), e)),
                };
                RequestValue::Bytes(Arc::new(bytes))
            }
            _ => RequestValue::None,
        };

        let request = RequestOp {
            id: envelope.id,
            value,
            collection_key: envelope.key,
            criteria: envelope.criteria,
            path: envelope.path,
            action: envelope.action,
            extra: envelope.extra.map(Arc::new),
            ..RequestOp::new(envelope.verb, envelope.model_type)
        }
        .at(envelope.time_ms);

        Ok(PendingChange {
            file_name: file_name.to_string(),
            request,
        })
    }

    /// Delete an envelope and then its attachments.
    pub async fn remove(&self, file_name: &str) -> StrataResult<()> {
        remove_file(&self.dir.join(file_name)).await?;
        if let Some(number) = envelope_number(file_name) {
            for name in list_names(&self.dir).await? {
                if attachment_owner(&name) == Some(number) {
                    remove_file(&self.dir.join(&name)).await?;
                }
            }
        }
        Ok(())
    }
}

async fn list_names(dir: &Path) -> StrataResult<Vec<String>> {
    let mut entries = fs::read_dir(dir).await.map_err(|e| StrataError::io(dir, e))?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| StrataError::io(dir, e))? {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

async fn exists(path: &Path) -> StrataResult<bool> {
    fs::try_exists(path).await.map_err(|e| StrataError::io(path, e))
}

async fn remove_file(path: &Path) -> StrataResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StrataError::io(path, e)),
    }
}

/// Write to a temporary sibling and rename into place.
async fn write_atomic(path: &Path, bytes: &[u8]) -> StrataResult<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(TEMP_EXT);
    let temp = PathBuf::from(temp);
    fs::write(&temp, bytes)
        .await
        .map_err(|e| StrataError::io(&temp, e))?;
    fs::rename(&temp, path)
        .await
        .map_err(|e| StrataError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn queue() -> (PendingQueue, TempDir) {
        let dir = TempDir::new().unwrap();
        let queue = PendingQueue::open(dir.path()).await.unwrap();
        (queue, dir)
    }

    #[test]
    fn test_file_names() {
        assert_eq!(envelope_name(42), "0000000000000042.json");
        assert_eq!(envelope_number("0000000000000042.json"), Some(42));
        assert_eq!(envelope_number("0000000000000042__Value.bin"), None);
        assert_eq!(envelope_number("42.json"), None);
        assert_eq!(attachment_owner(&attachment_name(42, "Value")), Some(42));
    }

    #[tokio::test]
    async fn test_same_millisecond_keeps_call_order() {
        let (queue, _dir) = queue().await;
        let a = queue
            .enqueue(&RequestOp::create(Model::new("Note").with_id(-1)).at(1_000))
            .await
            .unwrap();
        let b = queue
            .enqueue(&RequestOp::create(Model::new("Note").with_id(-2)).at(1_000))
            .await
            .unwrap();
        // An earlier clock reading still sorts after what was queued.
        let c = queue
            .enqueue(&RequestOp::create(Model::new("Note").with_id(-3)).at(999))
            .await
            .unwrap();

        assert_eq!(queue.list().await.unwrap(), vec![a.clone(), b.clone(), c.clone()]);
        assert_eq!(a, "0000000000001000.json");
        assert_eq!(b, "0000000000001001.json");
        assert_eq!(c, "0000000000001002.json");
    }

    #[tokio::test]
    async fn test_envelope_format() {
        let (queue, dir) = queue().await;
        let prior = Arc::new(Model::new("Note").with_id(4).with("text", "a"));
        let name = queue
            .enqueue(&RequestOp::update(prior, ChangeSet::new().set("text", "b")).at(5))
            .await
            .unwrap();

        let raw: Value = serde_json::from_slice(&std::fs::read(dir.path().join(&name)).unwrap()).unwrap();
        assert_eq!(raw["Verb"], json!("Update"));
        assert_eq!(raw["Type"], json!("Note"));
        assert_eq!(raw["Id"], json!(4));
        assert_eq!(raw["TimeMs"], json!(5));
        assert_eq!(raw["Value"], json!({"text": "b"}));
        assert_eq!(raw["Extra"]["attributes"]["text"], json!("a"));
        assert!(raw.get("externals").is_none());
    }

    #[tokio::test]
    async fn test_blob_payload_is_externalized() {
        let (queue, dir) = queue().await;
        let name = queue
            .enqueue(&RequestOp::blob_put("photos/1.png", vec![1, 2, 3]).at(10))
            .await
            .unwrap();
        assert!(dir.path().join("0000000000000010__Value.bin").exists());

        let loaded = queue.load(&name).await.unwrap();
        assert_eq!(loaded.request.verb, Verb::BlobPut);
        assert_eq!(loaded.request.path.as_deref(), Some("photos/1.png"));
        assert_eq!(loaded.request.value.as_bytes().map(|b| b.len()), Some(3));

        queue.remove(&name).await.unwrap();
        assert!(queue.is_empty().await.unwrap());
        assert!(!dir.path().join("0000000000000010__Value.bin").exists());
    }

    #[tokio::test]
    async fn test_open_sweeps_orphans_and_resumes_numbering() {
        let dir = TempDir::new().unwrap();
        {
            let queue = PendingQueue::open(dir.path()).await.unwrap();
            queue
                .enqueue(&RequestOp::blob_put("a", vec![0]).at(100))
                .await
                .unwrap();
        }
        // Crash between deleting an envelope and its attachment.
        std::fs::remove_file(dir.path().join("0000000000000100.json")).unwrap();
        std::fs::write(dir.path().join("0000000000000200.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("0000000000000300.json.tmp"), b"partial").unwrap();

        let queue = PendingQueue::open(dir.path()).await.unwrap();
        assert!(!dir.path().join("0000000000000100__Value.bin").exists());
        assert!(!dir.path().join("0000000000000300.json.tmp").exists());

        let next = queue
            .enqueue(&RequestOp::execute("Note", "refresh", json!({})).at(5))
            .await
            .unwrap();
        assert_eq!(next, "0000000000000201.json");
    }

    #[tokio::test]
    async fn test_load_reports_corrupt_and_missing_attachment() {
        let (queue, dir) = queue().await;
        std::fs::write(dir.path().join("0000000000000001.json"), b"not json").unwrap();
        let err = queue.load("0000000000000001.json").await.unwrap_err();
        assert!(matches!(err, StrataError::Queue(QueueError::CorruptRecord { .. })));

        let name = queue.enqueue(&RequestOp::blob_put("b", vec![1]).at(50)).await.unwrap();
        std::fs::remove_file(dir.path().join("0000000000000050__Value.bin")).unwrap();
        let err = queue.load(&name).await.unwrap_err();
        assert!(matches!(err, StrataError::Queue(QueueError::MissingAttachment { .. })));
    }

    #[tokio::test]
    async fn test_create_round_trips_through_disk() {
        let (queue, _dir) = queue().await;
        let request = RequestOp::create(Model::new("Note").with_id(-9).with("text", "hi")).at(77);
        let name = queue.enqueue(&request).await.unwrap();
        let loaded = queue.load(&name).await.unwrap();
        assert_eq!(loaded.request, request);
    }

    #[tokio::test]
    async fn test_destroy_by_bare_id_loads() {
        let (queue, _dir) = queue().await;
        let request = RequestOp {
            id: Some(ModelId::Int(2)),
            ..RequestOp::new(Verb::Destroy, "Note")
        }
        .at(30);
        let name = queue.enqueue(&request).await.unwrap();

        let loaded = queue.load(&name).await.unwrap();
        assert_eq!(loaded.request.value, RequestValue::None);
        assert_eq!(loaded.request, request);
    }

    #[tokio::test]
    async fn test_rewrite_keeps_replay_position() {
        let (queue, _dir) = queue().await;
        let first = queue
            .enqueue(&RequestOp::create(Model::new("Note").with_id(-1)).at(10))
            .await
            .unwrap();
        let second = queue
            .enqueue(&RequestOp::create(Model::new("Note").with_id(-2)).at(20))
            .await
            .unwrap();

        let replacement = RequestOp::create(Model::new("Note").with_id(7)).at(10);
        queue.rewrite(&first, &replacement).await.unwrap();

        assert_eq!(queue.list().await.unwrap(), vec![first.clone(), second]);
        assert_eq!(queue.load(&first).await.unwrap().request, replacement);
        assert!(queue.rewrite("notes.txt", &replacement).await.is_err());
    }
}
