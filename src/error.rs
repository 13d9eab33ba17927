//! Error types for the fetch pipeline and the storage substrate.
//!
//! Plumbing errors (config, opening storage) go through `color_eyre`.
//! The types here are the ones the resilience layers need to inspect.

use std::time::Duration;

/// Why a single fetch attempt failed.
///
/// Every variant is retryable: malformed bodies are treated exactly like
/// network failures.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum FetchError {
  #[error("request timed out after {}ms", .0.as_millis())]
  Timeout(Duration),

  #[error("transport error: {0}")]
  Transport(String),

  #[error("upstream returned HTTP {0}")]
  Status(u16),

  #[error("malformed response: {0}")]
  Malformed(String),
}

/// All attempts against one endpoint failed.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
#[error("{attempts} attempt(s) against {url} failed, last error: {last}")]
pub struct RetryExhausted {
  pub url: String,
  pub attempts: u32,
  pub last: FetchError,
}

/// Failures of the key/value substrate. Never escapes the cache or ledger.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
  #[error("storage backend error: {0}")]
  Backend(#[from] rusqlite::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("quota exceeded: {size} bytes written for key {key}, limit is {limit}")]
  QuotaExceeded {
    key: String,
    size: usize,
    limit: usize,
  },

  #[error("lock poisoned: {0}")]
  Poisoned(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
