//! Cache store: TTL semantics over a key/value backend.

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::traits::CacheEntry;
use super::{CACHE_PREFIX, RESULT_PREFIX};
use crate::storage::KeyValueStore;

/// Cache with per-entry TTL and lazy eviction.
///
/// Storage and serialization failures are logged and then treated as a
/// miss (reads) or a no-op (writes). Nothing here returns an error.
pub struct CacheStore {
  storage: Arc<dyn KeyValueStore>,
  /// TTL used by [`CacheStore::store`]
  default_ttl: Duration,
}

impl CacheStore {
  /// Create a new cache on top of the given storage backend.
  pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
    Self {
      storage,
      default_ttl: Duration::from_secs(24 * 60 * 60),
    }
  }

  /// Set the TTL used when none is given explicitly.
  pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
    self.default_ttl = ttl;
    self
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  /// Read the value under `key`, or `None` if absent, expired or unreadable.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    self.get_entry(key).map(|entry| entry.value)
  }

  /// Like [`CacheStore::get`] but keeps the envelope metadata.
  pub fn get_entry<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
    let raw = match self.storage.get(key) {
      Ok(Some(raw)) => raw,
      Ok(None) => return None,
      Err(e) => {
        warn!(key, error = %e, "cache read failed");
        return None;
      }
    };

    let entry: CacheEntry<T> = match serde_json::from_str(&raw) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key, error = %e, "cache entry is unreadable, treating as miss");
        return None;
      }
    };

    if entry.is_valid() {
      return Some(entry);
    }

    debug!(key, "cache entry expired, evicting");
    self.invalidate(key);
    None
  }

  /// Write `value` under `key` with the given TTL, replacing any prior entry.
  pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
    let entry = CacheEntry::new(value, ttl);

    let raw = match serde_json::to_string(&entry) {
      Ok(raw) => raw,
      Err(e) => {
        warn!(key, error = %e, "failed to serialize cache entry");
        return;
      }
    };

    if let Err(e) = self.storage.set(key, &raw) {
      warn!(key, error = %e, "cache write failed");
    }
  }

  /// Write `value` under `key` with the default TTL.
  pub fn store<T: Serialize>(&self, key: &str, value: &T) {
    self.set(key, value, self.default_ttl);
  }

  /// Remove the entry under `key` regardless of its TTL.
  pub fn invalidate(&self, key: &str) {
    if let Err(e) = self.storage.remove(key) {
      warn!(key, error = %e, "cache invalidation failed");
    }
  }

  /// Remove every expired cache entry. Returns the number removed.
  ///
  /// Keys under the cache prefixes that don't hold a cache envelope
  /// (such as the error journal) are left untouched.
  pub fn purge_expired(&self) -> usize {
    let mut removed = 0;

    for prefix in [CACHE_PREFIX, RESULT_PREFIX] {
      let keys = match self.storage.keys_with_prefix(prefix) {
        Ok(keys) => keys,
        Err(e) => {
          warn!(prefix, error = %e, "failed to list cache keys");
          continue;
        }
      };

      for key in keys {
        let Ok(Some(raw)) = self.storage.get(&key) else {
          continue;
        };
        let Ok(entry) = serde_json::from_str::<CacheEntry<serde_json::Value>>(&raw) else {
          continue;
        };
        if !entry.is_valid() && self.storage.remove(&key).is_ok() {
          removed += 1;
        }
      }
    }

    if removed > 0 {
      debug!(removed, "purged expired cache entries");
    }
    removed
  }
}

impl Clone for CacheStore {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      default_ttl: self.default_ttl,
    }
  }
}
