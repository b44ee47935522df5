//! Read caching with staleness control and offline fallback.
//!
//! This module provides:
//! - A TTL cache store over the key-value store, one entry per key
//! - Self-healing reads (corrupt entries are evicted and treated as misses)
//! - A read-through layer that prefers the network when online and falls back
//!   to cached data when offline or when the live fetch fails
//! - Normalized, hashed cache keys for catalog queries

mod key;
mod layer;
mod storage;
mod traits;

pub use key::CatalogKey;
pub use layer::{CacheLayer, ReadStrategy};
pub use storage::{CacheEntry, CacheStore, CACHE_PREFIX};
pub use traits::{CacheResult, CacheSource, QueryKey};
