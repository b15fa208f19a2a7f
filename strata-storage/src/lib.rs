//! Strata Storage - Layered Cache Orchestration
//!
//! Runs requests through an ordered chain of cache layers in front of an
//! origin, pins entries against bulk clearing, and queues writes made
//! while offline for later replay.
//!
//! The protocol types live in `strata-core`; this crate performs the I/O.

pub mod cache;
pub mod hold;
pub mod origin;
pub mod pending;
pub mod populate;
pub mod store;

pub use cache::{CacheKey, CacheLayer, GuardedLayer, LayerStats, LmdbLayer, LmdbLayerError, MemoryLayer};
pub use hold::{HoldRegistry, HoldScope};
pub use origin::Origin;
pub use pending::{PendingChange, PendingQueue};
pub use store::{LayeredStore, OFFLINE_SOURCE};
