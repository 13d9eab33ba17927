//! Persistent journal of pipeline failures, newest last.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::storage::KeyValueStore;

pub const JOURNAL_KEY: &str = "ods_sergipe_erros";

const DEFAULT_CAPACITY: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
  pub indicator: String,
  pub message: String,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub timestamp: DateTime<Utc>,
}

pub struct ErrorJournal {
  storage: Arc<dyn KeyValueStore>,
  capacity: usize,
  write_lock: Mutex<()>,
}

impl ErrorJournal {
  pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
    Self {
      storage,
      capacity: DEFAULT_CAPACITY,
      write_lock: Mutex::new(()),
    }
  }

  pub fn with_capacity(mut self, capacity: usize) -> Self {
    self.capacity = capacity.max(1);
    self
  }

  /// Record a failure. Oldest entries are dropped past the capacity.
  pub fn append(&self, indicator: &str, message: &str) {
    let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

    let mut entries = self.entries();
    entries.push(JournalEntry {
      indicator: indicator.to_string(),
      message: message.to_string(),
      timestamp: Utc::now(),
    });
    if entries.len() > self.capacity {
      let excess = entries.len() - self.capacity;
      entries.drain(..excess);
    }

    let raw = match serde_json::to_string(&entries) {
      Ok(raw) => raw,
      Err(e) => {
        warn!(indicator, error = %e, "failed to serialize error journal");
        return;
      }
    };
    if let Err(e) = self.storage.set(JOURNAL_KEY, &raw) {
      warn!(indicator, error = %e, "failed to write error journal");
    }
  }

  /// All recorded entries, oldest first.
  pub fn entries(&self) -> Vec<JournalEntry> {
    let raw = match self.storage.get(JOURNAL_KEY) {
      Ok(Some(raw)) => raw,
      Ok(None) => return Vec::new(),
      Err(e) => {
        warn!(error = %e, "failed to read error journal");
        return Vec::new();
      }
    };

    serde_json::from_str(&raw).unwrap_or_else(|e| {
      warn!(error = %e, "error journal is unreadable, starting over");
      Vec::new()
    })
  }

  pub fn clear(&self) {
    if let Err(e) = self.storage.remove(JOURNAL_KEY) {
      warn!(error = %e, "failed to clear error journal");
    }
  }
}
