//! Bounded retries against a single endpoint.
//!
//! Attempt `i` (from 1) that fails is followed by a wait of
//! `base_delay * 2^(i-1)`, except after the last attempt. With a base of
//! 500ms and 3 attempts the waits are 500ms then 1000ms.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{FetchError, RetryExhausted};
use crate::indicators::api_types::decode_reading;
use crate::indicators::client::Transport;
use crate::indicators::types::Reading;

/// Delay to wait after failed attempt number `attempt` (1-based).
///
/// No jitter: callers rely on the exact doubling.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
  if attempt == 0 {
    return Duration::ZERO;
  }

  let factor = 2u32.saturating_pow(attempt - 1);
  base.saturating_mul(factor).min(max)
}

/// Retries one URL with exponential backoff and a per-attempt timeout.
pub struct RetryEngine<T: Transport> {
  transport: Arc<T>,
  timeout: Duration,
  max_delay: Duration,
}

impl<T: Transport> RetryEngine<T> {
  pub fn new(transport: Arc<T>, timeout: Duration) -> Self {
    Self {
      transport,
      timeout,
      max_delay: Duration::from_secs(30),
    }
  }

  pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
    self.max_delay = max_delay;
    self
  }

  /// Up to `max_attempts` sequential attempts against `url`.
  ///
  /// Returns on the first well-formed response without further waits.
  /// `max_attempts` of 0 is treated as 1.
  pub async fn attempt_with_retry(
    &self,
    url: &str,
    max_attempts: u32,
    base_delay: Duration,
  ) -> Result<Reading, RetryExhausted> {
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;

    loop {
      match self.attempt_once(url).await {
        Ok(reading) => {
          debug!(url, attempt, value = reading.value, "attempt succeeded");
          return Ok(reading);
        }
        Err(error) if attempt >= max_attempts => {
          warn!(url, attempts = attempt, error = %error, "retry budget exhausted");
          return Err(RetryExhausted {
            url: url.to_string(),
            attempts: attempt,
            last: error,
          });
        }
        Err(error) => {
          let delay = backoff_delay(attempt, base_delay, self.max_delay);
          debug!(
            url,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "attempt failed, backing off"
          );
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
      }
    }
  }

  /// One GET bounded by the timeout. On timeout the request future is
  /// dropped, which aborts the in-flight request.
  async fn attempt_once(&self, url: &str) -> Result<Reading, FetchError> {
    let response = tokio::time::timeout(self.timeout, self.transport.get(url))
      .await
      .map_err(|_| FetchError::Timeout(self.timeout))??;

    if !response.is_success() {
      return Err(FetchError::Status(response.status));
    }

    decode_reading(&response.body)
  }
}
