//! Cache entry envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A cached value together with the data needed to decide its validity.
///
/// Serialized as `{"value": ..., "storedAt": <epoch ms>, "ttlMillis": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
  pub value: T,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub stored_at: DateTime<Utc>,
  pub ttl_millis: u64,
}

impl<T> CacheEntry<T> {
  pub fn new(value: T, ttl: Duration) -> Self {
    Self {
      value,
      stored_at: Utc::now(),
      ttl_millis: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
    }
  }

  /// An entry is valid iff `now - stored_at < ttl`.
  pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
    let age_ms = (now - self.stored_at).num_milliseconds();
    // i128 so that u64::MAX TTLs don't wrap
    i128::from(age_ms) < i128::from(self.ttl_millis)
  }

  pub fn is_valid(&self) -> bool {
    self.is_valid_at(Utc::now())
  }
}
