//! Local bounded cache and the namespaced, shard-safe cache built on it

pub mod local;
pub mod namespaced;

pub use local::{CacheEntry, CacheStats, LocalBoundedCache};
pub use namespaced::{NamespacedCache, NamespacedCacheOptions, TypedNamespace};
