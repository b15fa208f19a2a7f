//! Error types for Strata operations

use crate::Verb;
use thiserror::Error;

/// Errors raised when a read cannot be satisfied without the origin.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OfflineError {
    #[error("Data not available offline: {verb:?} {model_type} {key}")]
    DataNotAvailable {
        verb: Verb,
        model_type: String,
        key: String,
    },
}

/// Errors raised when the origin cannot be reached.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Origin unreachable for {model_type}: {reason}")]
    OriginUnreachable { model_type: String, reason: String },
}

/// Programmer errors: malformed declarations or misuse of the API.
///
/// These are never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("Unknown model type: {model_type}")]
    UnknownModelType { model_type: String },

    #[error("Unknown property {property} on {model_type}")]
    UnknownProperty {
        model_type: String,
        property: String,
    },

    #[error("Unknown association {association} on {model_type}")]
    UnknownAssociation {
        model_type: String,
        association: String,
    },

    #[error("Property {property} on {model_type} is not a comparable id type")]
    NotComparable {
        model_type: String,
        property: String,
    },

    #[error("Cardinality mismatch for {model_type}.{property}: {reason}")]
    CardinalityMismatch {
        model_type: String,
        property: String,
        reason: String,
    },

    #[error("Model of type {model_type} has no id")]
    MissingId { model_type: String },

    #[error("Invalid payload for {verb:?}: {reason}")]
    InvalidPayload { verb: Verb, reason: String },

    #[error("Converter for {model_type}.{property} failed: {reason}")]
    ConversionFailed {
        model_type: String,
        property: String,
        reason: String,
    },
}

/// Cache-layer and file-store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("I/O error at {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },

    #[error("Backend {backend} failed: {reason}")]
    Backend { backend: String, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Pending-change queue errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Pending change {file} is corrupt: {reason}")]
    CorruptRecord { file: String, reason: String },

    #[error("Pending change {file} references missing attachment {attachment}")]
    MissingAttachment { file: String, attachment: String },

    #[error("Replay of {file} failed: {reason}")]
    ReplayFailed { file: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all Strata errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StrataError {
    #[error("Offline: {0}")]
    Offline(#[from] OfflineError),

    #[error("Connection failure: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Argument error: {0}")]
    Argument(#[from] ArgumentError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl StrataError {
    /// Shorthand for a `DataNotAvailableOffline` failure.
    pub fn not_available(verb: Verb, model_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Offline(OfflineError::DataNotAvailable {
            verb,
            model_type: model_type.into(),
            key: key.into(),
        })
    }

    /// Wrap an I/O error with the path it concerns.
    pub fn io(path: impl AsRef<std::path::Path>, err: std::io::Error) -> Self {
        Self::Storage(StorageError::Io {
            path: path.as_ref().display().to_string(),
            reason: err.to_string(),
        })
    }

    /// Wrap a serde_json error.
    pub fn serialization(err: serde_json::Error) -> Self {
        Self::Storage(StorageError::Serialization {
            reason: err.to_string(),
        })
    }

    /// True for `DataNotAvailableOffline`.
    pub fn is_offline(&self) -> bool {
        matches!(self, Self::Offline(_))
    }

    /// True when the origin could not be reached.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Get error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Offline(_) => "offline",
            Self::Connection(_) => "connection",
            Self::Argument(_) => "argument",
            Self::Storage(_) => "storage",
            Self::Queue(_) => "queue",
            Self::Config(_) => "config",
        }
    }
}

/// Result type alias for Strata operations.
pub type StrataResult<T> = Result<T, StrataError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_error_display() {
        let err = StrataError::not_available(Verb::Get, "Person", "12");
        let msg = format!("{}", err);
        assert!(msg.contains("Data not available offline"));
        assert!(msg.contains("Person"));
        assert!(msg.contains("12"));
        assert!(err.is_offline());
        assert!(!err.is_connection_failure());
    }

    #[test]
    fn test_argument_error_display_cardinality() {
        let err = ArgumentError::CardinalityMismatch {
            model_type: "Parent".to_string(),
            property: "children".to_string(),
            reason: "has-many requires a list field".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Parent.children"));
        assert!(msg.contains("list field"));
    }

    #[test]
    fn test_strata_error_from_variants() {
        let storage = StrataError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, StrataError::Storage(_)));
        assert_eq!(storage.category(), "storage");

        let queue = StrataError::from(QueueError::ReplayFailed {
            file: "0001.json".to_string(),
            reason: "boom".to_string(),
        });
        assert_eq!(queue.category(), "queue");

        let conn = StrataError::from(ConnectionError::OriginUnreachable {
            model_type: "Person".to_string(),
            reason: "timeout".to_string(),
        });
        assert!(conn.is_connection_failure());
    }

    #[test]
    fn test_io_helper_keeps_path() {
        let err = StrataError::io(
            "/tmp/pending/1.json",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        let msg = format!("{}", err);
        assert!(msg.contains("/tmp/pending/1.json"));
        assert!(msg.contains("gone"));
    }
}
