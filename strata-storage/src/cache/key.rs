//! Cache key encoding.
//!
//! Two encodings live here. [`CacheKey`] is the binary key used by the
//! LMDB layer; its leading kind byte groups records, collections and blobs
//! so a prefix scan can walk one namespace. The segment helpers produce
//! file names for the hold registry and are reversible.

use strata_core::ModelId;

/// Separator byte between key parts. Never valid inside UTF-8 text.
const SEPARATOR: u8 = 0xFF;

const KIND_RECORD: u8 = b'r';
const KIND_COLLECTION: u8 = b'c';
const KIND_BLOB: u8 = b'b';
/// Prefix for the arrival stamp stored beside a value.
const KIND_STAMP: u8 = b'#';

const ID_INT: u8 = b'i';
const ID_TEXT: u8 = b's';

/// Key of one cached entry.
///
/// # Binary Format
///
/// - Record: `r` type `0xFF` id-tag
/// - Collection: `c` type `0xFF` name
/// - Blob: `b` path
///
/// The id tag is `i` followed by the big-endian integer with its sign bit
/// flipped, or `s` followed by the text, so integer ids sort numerically.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Record { model_type: String, id: ModelId },
    Collection { model_type: String, name: String },
    Blob { path: String },
}

impl CacheKey {
    pub fn record(model_type: impl Into<String>, id: ModelId) -> Self {
        Self::Record {
            model_type: model_type.into(),
            id,
        }
    }

    pub fn collection(model_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Collection {
            model_type: model_type.into(),
            name: name.into(),
        }
    }

    pub fn blob(path: impl Into<String>) -> Self {
        Self::Blob { path: path.into() }
    }

    /// Encode to the binary key.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::Record { model_type, id } => {
                out.push(KIND_RECORD);
                out.extend_from_slice(model_type.as_bytes());
                out.push(SEPARATOR);
                match id {
                    ModelId::Int(n) => {
                        out.push(ID_INT);
                        out.extend_from_slice(&((*n as u64) ^ (1 << 63)).to_be_bytes());
                    }
                    ModelId::Text(s) => {
                        out.push(ID_TEXT);
                        out.extend_from_slice(s.as_bytes());
                    }
                }
            }
            Self::Collection { model_type, name } => {
                out.push(KIND_COLLECTION);
                out.extend_from_slice(model_type.as_bytes());
                out.push(SEPARATOR);
                out.extend_from_slice(name.as_bytes());
            }
            Self::Blob { path } => {
                out.push(KIND_BLOB);
                out.extend_from_slice(path.as_bytes());
            }
        }
        out
    }

    /// Decode a binary key. Returns `None` for stamp keys and malformed input.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (&kind, rest) = bytes.split_first()?;
        match kind {
            KIND_RECORD => {
                let (model_type, tag) = split_type(rest)?;
                let (&id_kind, id_bytes) = tag.split_first()?;
                let id = match id_kind {
                    ID_INT => {
                        let raw: [u8; 8] = id_bytes.try_into().ok()?;
                        ModelId::Int((u64::from_be_bytes(raw) ^ (1 << 63)) as i64)
                    }
                    ID_TEXT => ModelId::Text(String::from_utf8(id_bytes.to_vec()).ok()?),
                    _ => return None,
                };
                Some(Self::Record { model_type, id })
            }
            KIND_COLLECTION => {
                let (model_type, name) = split_type(rest)?;
                Some(Self::Collection {
                    model_type,
                    name: String::from_utf8(name.to_vec()).ok()?,
                })
            }
            KIND_BLOB => Some(Self::Blob {
                path: String::from_utf8(rest.to_vec()).ok()?,
            }),
            _ => None,
        }
    }

    /// Key under which this entry's arrival stamp is stored.
    pub fn stamp_key(&self) -> Vec<u8> {
        let mut out = vec![KIND_STAMP];
        out.extend(self.encode());
        out
    }

    /// Prefix shared by every record of `model_type`.
    pub fn record_prefix(model_type: &str) -> Vec<u8> {
        let mut out = vec![KIND_RECORD];
        out.extend_from_slice(model_type.as_bytes());
        out.push(SEPARATOR);
        out
    }

    /// True for stamp keys.
    pub fn is_stamp(bytes: &[u8]) -> bool {
        bytes.first() == Some(&KIND_STAMP)
    }
}

fn split_type(bytes: &[u8]) -> Option<(String, &[u8])> {
    let pos = bytes.iter().position(|b| *b == SEPARATOR)?;
    let model_type = String::from_utf8(bytes[..pos].to_vec()).ok()?;
    Some((model_type, &bytes[pos + 1..]))
}

// ============================================================================
// FILE NAME SEGMENTS
// ============================================================================

fn is_plain(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.')
}

/// Escape arbitrary text into a single portable file name.
///
/// Bytes outside `[A-Za-z0-9._-]` become `%XX`, as does a leading dot.
pub fn encode_segment(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for (i, byte) in text.bytes().enumerate() {
        if is_plain(byte) && !(i == 0 && byte == b'.') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    if out.is_empty() {
        out.push('%');
    }
    out
}

/// Reverse [`encode_segment`].
pub fn decode_segment(segment: &str) -> Option<String> {
    if segment == "%" {
        return Some(String::new());
    }
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = segment.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// File name for a model id: `i<n>` or `s<escaped text>`.
pub fn encode_id(id: &ModelId) -> String {
    match id {
        ModelId::Int(n) => format!("i{}", n),
        ModelId::Text(s) => format!("s{}", encode_segment(s)),
    }
}

/// Reverse [`encode_id`].
pub fn decode_id(name: &str) -> Option<ModelId> {
    let rest = name.get(1..)?;
    match name.as_bytes().first()? {
        b'i' => rest.parse().ok().map(ModelId::Int),
        b's' => decode_segment(rest).map(ModelId::Text),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_key_decodes() {
        let key = CacheKey::record("Person", ModelId::Int(-42));
        assert_eq!(CacheKey::decode(&key.encode()), Some(key));

        let key = CacheKey::record("Person", ModelId::from("a\u{e9}b"));
        assert_eq!(CacheKey::decode(&key.encode()), Some(key));
    }

    #[test]
    fn test_integer_ids_sort_numerically() {
        let a = CacheKey::record("T", ModelId::Int(-5)).encode();
        let b = CacheKey::record("T", ModelId::Int(3)).encode();
        let c = CacheKey::record("T", ModelId::Int(300)).encode();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_record_prefix_isolates_types() {
        let prefix = CacheKey::record_prefix("Child");
        assert!(CacheKey::record("Child", ModelId::Int(1)).encode().starts_with(&prefix));
        assert!(!CacheKey::record("Children", ModelId::Int(1)).encode().starts_with(&prefix));
    }

    #[test]
    fn test_stamp_keys_are_not_entries() {
        let stamp = CacheKey::blob("a/b.png").stamp_key();
        assert!(CacheKey::is_stamp(&stamp));
        assert_eq!(CacheKey::decode(&stamp), None);
    }

    #[test]
    fn test_segment_escaping() {
        assert_eq!(encode_segment("photos/1.png"), "photos%2F1.png");
        assert_eq!(encode_segment(".hidden"), "%2Ehidden");
        assert_eq!(encode_segment(""), "%");
        for raw in ["photos/1.png", ".hidden", "", "snow \u{2603}", "100%"] {
            assert_eq!(decode_segment(&encode_segment(raw)).as_deref(), Some(raw));
        }
        assert_eq!(decode_segment("%G1"), None);
    }

    #[test]
    fn test_id_names() {
        assert_eq!(encode_id(&ModelId::Int(-7)), "i-7");
        assert_eq!(decode_id("i-7"), Some(ModelId::Int(-7)));
        assert_eq!(decode_id(&encode_id(&ModelId::from("x/y"))), Some(ModelId::from("x/y")));
        assert_eq!(decode_id("q1"), None);
    }
}
