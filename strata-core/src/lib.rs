//! Strata Core - Protocol Types
//!
//! Request/response descriptions, the freshness policy, the model
//! representation and the model registry shared by every Strata crate.
//! This crate performs no I/O.

pub mod association;
pub mod config;
pub mod error;
pub mod freshness;
pub mod model;
pub mod registry;
pub mod request;
pub mod response;

pub use association::{join_collection_key, Association, BlobConverter, PropertyConverter};
pub use config::{StrataConfig, DEFAULT_FRESHNESS_SECS, DEFAULT_MAX_PARALLELISM};
pub use error::{
    ArgumentError, ConfigError, ConnectionError, OfflineError, QueueError, StorageError,
    StrataError, StrataResult,
};
pub use freshness::{is_acceptable, Freshness};
pub use model::{AssociationValue, ChangeSet, Model, ModelId};
pub use registry::{FieldKind, IdKind, ModelDescriptor, ModelRegistry};
pub use request::{RequestOp, RequestValue, Verb};
pub use response::{LayerIndex, OpResponse, OpResult};

use chrono::Utc;
use uuid::Uuid;

// ============================================================================
// TIME AND IDENTITY
// ============================================================================

/// Milliseconds since the Unix epoch.
pub type TimeMs = i64;

/// Current wall-clock time in milliseconds.
pub fn now_ms() -> TimeMs {
    Utc::now().timestamp_millis()
}

/// Generate a new timestamp-sortable GUID string.
pub fn new_guid() -> String {
    Uuid::now_v7().to_string()
}
