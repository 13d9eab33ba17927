//! TTL cache for indicator data.
//!
//! This module provides a small cache on top of a [`KeyValueStore`] that:
//! - Wraps every value in an envelope carrying its write time and TTL
//! - Evicts lazily: expired entries are removed when they are read
//! - Swallows storage failures so callers only ever see hits and misses
//!
//! [`KeyValueStore`]: crate::storage::KeyValueStore

mod store;
mod traits;

pub use store::CacheStore;
pub use traits::CacheEntry;

/// Prefix for values written through the generic cache API.
pub const CACHE_PREFIX: &str = "ods_cache_";

/// Prefix for per-indicator pipeline results.
pub const RESULT_PREFIX: &str = "ods_sergipe_";

/// Cache key for an arbitrary resource, e.g. an endpoint URL.
pub fn cache_key(resource: &str) -> String {
  format!("{}{}", CACHE_PREFIX, resource)
}

/// Cache key under which the pipeline result for `indicator` is kept.
pub fn result_key(indicator: &str) -> String {
  format!("{}{}", RESULT_PREFIX, indicator)
}
