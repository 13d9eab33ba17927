//! Per-indicator circuit breaker ledger.
//!
//! # State
//! - `failure_count`: consecutive failed attempts since the last success
//! - `is_open`: set once `failure_count` reaches the threshold
//! - `opened_at`: when the breaker tripped (re-stamped when a trial fails)
//!
//! State lives in session-scoped storage under `circuit_breaker_<indicator>`
//! so it survives reloads within one session but not a new one.
//!
//! # Policies
//! - `gate`: while open and inside the open window no attempt is allowed;
//!   after the window one trial chain runs (half-open)
//! - `record`: outcomes are recorded but attempts are never blocked

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{BreakerConfig, BreakerPolicy};
use crate::storage::KeyValueStore;

const KEY_PREFIX: &str = "circuit_breaker_";

/// Persisted breaker state for one indicator.
///
/// Wire format: `{"falhas": 3, "ativo": true, "abertoEm": <epoch ms>}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerState {
  #[serde(rename = "falhas")]
  pub failure_count: u32,
  #[serde(rename = "ativo")]
  pub is_open: bool,
  #[serde(
    rename = "abertoEm",
    default,
    with = "chrono::serde::ts_milliseconds_option"
  )]
  pub opened_at: Option<DateTime<Utc>>,
}

pub fn breaker_key(indicator: &str) -> String {
  format!("{}{}", KEY_PREFIX, indicator)
}

/// Records failures and successes per indicator.
pub struct BreakerLedger {
  storage: Arc<dyn KeyValueStore>,
  config: BreakerConfig,
  /// Serializes read-modify-write cycles on the stored state
  write_lock: Mutex<()>,
}

impl BreakerLedger {
  pub fn new(storage: Arc<dyn KeyValueStore>, config: BreakerConfig) -> Self {
    Self {
      storage,
      config,
      write_lock: Mutex::new(()),
    }
  }

  /// Current state, or `None` when nothing has been recorded.
  pub fn state(&self, indicator: &str) -> Option<BreakerState> {
    let key = breaker_key(indicator);

    let raw = match self.storage.get(&key) {
      Ok(raw) => raw?,
      Err(e) => {
        warn!(indicator, error = %e, "failed to read breaker state");
        return None;
      }
    };

    match serde_json::from_str(&raw) {
      Ok(state) => Some(state),
      Err(e) => {
        warn!(indicator, error = %e, "breaker state is unreadable, ignoring");
        None
      }
    }
  }

  pub fn is_open(&self, indicator: &str) -> bool {
    self.state(indicator).is_some_and(|state| state.is_open)
  }

  /// Whether a network attempt chain may run for `indicator` right now.
  pub fn allows_attempt(&self, indicator: &str) -> bool {
    if self.config.policy == BreakerPolicy::Record {
      return true;
    }

    match self.state(indicator) {
      Some(state) if state.is_open => self.window_elapsed(&state),
      _ => true,
    }
  }

  /// Count one failed attempt; opens the breaker at the threshold.
  pub fn record_failure(&self, indicator: &str) -> BreakerState {
    let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

    let mut state = self.state(indicator).unwrap_or_default();
    state.failure_count = state.failure_count.saturating_add(1);

    if state.failure_count >= self.config.threshold {
      if !state.is_open {
        state.is_open = true;
        state.opened_at = Some(Utc::now());
        info!(
          indicator,
          failures = state.failure_count,
          open_window_ms = self.config.open_window_ms,
          "circuit breaker opened"
        );
      } else if self.window_elapsed(&state) {
        // failed trial: start a new open window
        state.opened_at = Some(Utc::now());
      }
    }

    self.persist(indicator, &state);
    state
  }

  /// Reset after a successful fetch.
  pub fn record_success(&self, indicator: &str) {
    let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

    if self.is_open(indicator) {
      info!(indicator, "circuit breaker closed after recovery");
    }
    self.remove(indicator);
  }

  /// Forget everything about `indicator` (user-requested retry).
  pub fn clear(&self, indicator: &str) {
    let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
    self.remove(indicator);
  }

  fn window_elapsed(&self, state: &BreakerState) -> bool {
    let Some(opened_at) = state.opened_at else {
      return true;
    };
    // a stamp in the future (clock skew) counts as just opened
    let elapsed = (Utc::now() - opened_at).to_std().unwrap_or(Duration::ZERO);
    elapsed >= self.config.open_window()
  }

  fn persist(&self, indicator: &str, state: &BreakerState) {
    let raw = match serde_json::to_string(state) {
      Ok(raw) => raw,
      Err(e) => {
        warn!(indicator, error = %e, "failed to serialize breaker state");
        return;
      }
    };

    if let Err(e) = self.storage.set(&breaker_key(indicator), &raw) {
      warn!(indicator, error = %e, "failed to persist breaker state");
    }
  }

  fn remove(&self, indicator: &str) {
    if let Err(e) = self.storage.remove(&breaker_key(indicator)) {
      warn!(indicator, error = %e, "failed to reset breaker state");
    }
  }
}
