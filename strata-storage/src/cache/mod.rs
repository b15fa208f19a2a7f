//! Cache layers.
//!
//! A store is configured with an ordered chain of [`CacheLayer`]s, fastest
//! first. Two implementations ship here: [`MemoryLayer`] keeps shared
//! instances in process and [`LmdbLayer`] persists to disk. The
//! orchestrator wraps each in a [`GuardedLayer`] so layer failures degrade
//! to misses.
//!
//! # Example
//!
//! ```ignore
//! let layers: Vec<Arc<dyn CacheLayer>> = vec![
//!     Arc::new(MemoryLayer::default()),
//!     Arc::new(LmdbLayer::open("disk", dir.join("lmdb"), 64)?),
//! ];
//! let store = LayeredStore::open(config, registry, origin, layers).await?;
//! ```

pub mod guarded;
pub mod key;
pub mod lmdb_backend;
pub mod memory_backend;
pub mod traits;

pub use guarded::GuardedLayer;
pub use key::CacheKey;
pub use lmdb_backend::{LmdbLayer, LmdbLayerError};
pub use memory_backend::MemoryLayer;
pub use traits::{CacheLayer, LayerStats};
