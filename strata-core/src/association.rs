//! Association descriptors.
//!
//! A closed set of relationship kinds attached to model properties at
//! registration time. The resolver matches on the variant.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Converts raw blob bytes into a property value.
pub type BlobConverter = Arc<dyn Fn(&[u8]) -> Result<Value, String> + Send + Sync>;

/// Converts a local property value, with extra arguments, into another value.
pub type PropertyConverter = Arc<dyn Fn(&Value, &[Value]) -> Result<Value, String> + Send + Sync>;

/// A declared relationship on a model property.
///
/// The related model type for `BelongsTo`, `HasMany` and `HasOne` is taken
/// from the property's declared field kind.
#[derive(Clone)]
pub enum Association {
    /// The owning model stores the related id in `id_property`.
    BelongsTo { id_property: String },
    /// Related models store this model's id in `foreign_id_property`.
    HasMany { foreign_id_property: String },
    /// Like `HasMany` but only the first related model is kept.
    HasOne { foreign_id_property: String },
    /// The value is derived from the blob at the path stored in `path_property`.
    FromBlob {
        path_property: String,
        converter: BlobConverter,
    },
    /// The value is derived locally from `source_property`. No I/O.
    FromProperty {
        source_property: String,
        converter: PropertyConverter,
        args: Vec<Value>,
    },
}

impl Association {
    pub fn belongs_to(id_property: impl Into<String>) -> Self {
        Self::BelongsTo {
            id_property: id_property.into(),
        }
    }

    pub fn has_many(foreign_id_property: impl Into<String>) -> Self {
        Self::HasMany {
            foreign_id_property: foreign_id_property.into(),
        }
    }

    pub fn has_one(foreign_id_property: impl Into<String>) -> Self {
        Self::HasOne {
            foreign_id_property: foreign_id_property.into(),
        }
    }

    pub fn from_blob<F>(path_property: impl Into<String>, converter: F) -> Self
    where
        F: Fn(&[u8]) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self::FromBlob {
            path_property: path_property.into(),
            converter: Arc::new(converter),
        }
    }

    pub fn from_property<F>(source_property: impl Into<String>, converter: F, args: Vec<Value>) -> Self
    where
        F: Fn(&Value, &[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self::FromProperty {
            source_property: source_property.into(),
            converter: Arc::new(converter),
            args,
        }
    }

    /// Short kind name for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BelongsTo { .. } => "belongs_to",
            Self::HasMany { .. } => "has_many",
            Self::HasOne { .. } => "has_one",
            Self::FromBlob { .. } => "from_blob",
            Self::FromProperty { .. } => "from_property",
        }
    }

    /// True for kinds that read related models through the orchestrator.
    pub fn is_relational(&self) -> bool {
        matches!(
            self,
            Self::BelongsTo { .. } | Self::HasMany { .. } | Self::HasOne { .. }
        )
    }
}

impl fmt::Debug for Association {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BelongsTo { id_property } => {
                f.debug_struct("BelongsTo").field("id_property", id_property).finish()
            }
            Self::HasMany {
                foreign_id_property,
            } => f
                .debug_struct("HasMany")
                .field("foreign_id_property", foreign_id_property)
                .finish(),
            Self::HasOne {
                foreign_id_property,
            } => f
                .debug_struct("HasOne")
                .field("foreign_id_property", foreign_id_property)
                .finish(),
            Self::FromBlob { path_property, .. } => f
                .debug_struct("FromBlob")
                .field("path_property", path_property)
                .finish_non_exhaustive(),
            Self::FromProperty {
                source_property,
                args,
                ..
            } => f
                .debug_struct("FromProperty")
                .field("source_property", source_property)
                .field("args", args)
                .finish_non_exhaustive(),
        }
    }
}

/// Deterministic collection key for a foreign-key join.
pub fn join_collection_key(foreign_type: &str, foreign_id_property: &str, own_id: &crate::ModelId) -> String {
    format!("{}:{}:{}", foreign_type, foreign_id_property, own_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ModelId;
    use serde_json::json;

    #[test]
    fn test_kinds() {
        assert_eq!(Association::belongs_to("parent_id").kind(), "belongs_to");
        assert!(Association::has_many("parent_id").is_relational());
        let blob = Association::from_blob("photo_path", |bytes| Ok(json!(bytes.len())));
        assert!(!blob.is_relational());
        assert!(format!("{:?}", blob).contains("photo_path"));
    }

    #[test]
    fn test_join_collection_key_is_deterministic() {
        let a = join_collection_key("Child", "parent_id", &ModelId::Int(1));
        let b = join_collection_key("Child", "parent_id", &ModelId::Int(1));
        assert_eq!(a, b);
        assert_eq!(a, "Child:parent_id:1");
    }

    #[test]
    fn test_property_converter_receives_args() {
        let assoc = Association::from_property(
            "first",
            |value, args| {
                let suffix = args.first().and_then(|a| a.as_str()).unwrap_or("");
                Ok(json!(format!("{}{}", value.as_str().unwrap_or(""), suffix)))
            },
            vec![json!("!")],
        );
        if let Association::FromProperty { converter, args, .. } = assoc {
            assert_eq!(converter(&json!("hi"), &args), Ok(json!("hi!")));
        } else {
            panic!("expected FromProperty");
        }
    }
}
