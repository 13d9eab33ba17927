//! Multi-endpoint fallback: candidate URLs are tried strictly in order,
//! each with its own retry budget, stopping at the first success.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::breaker::BreakerLedger;
use super::retry::RetryEngine;
use crate::error::RetryExhausted;
use crate::indicators::client::Transport;
use crate::indicators::types::Reading;

/// Every endpoint of an indicator failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("all {endpoints} endpoint(s) for {indicator} failed after {attempts} attempt(s)")]
pub struct EndpointsExhausted {
  pub indicator: String,
  pub endpoints: usize,
  pub attempts: u32,
  /// Last per-endpoint failure, `None` when no endpoint was configured
  pub last: Option<RetryExhausted>,
}

impl EndpointsExhausted {
  /// Human-readable reason, used in the error journal and the UI.
  pub fn reason(&self) -> String {
    match &self.last {
      Some(last) => format!("{}: {}", self, last.last),
      None => format!("no endpoints configured for {}", self.indicator),
    }
  }
}

pub struct EndpointOrchestrator<T: Transport> {
  engine: RetryEngine<T>,
  ledger: Arc<BreakerLedger>,
}

impl<T: Transport> EndpointOrchestrator<T> {
  pub fn new(engine: RetryEngine<T>, ledger: Arc<BreakerLedger>) -> Self {
    Self { engine, ledger }
  }

  /// Try `urls` in order; `None` when all of them are exhausted.
  pub async fn try_endpoints(
    &self,
    indicator: &str,
    urls: &[String],
    max_attempts: u32,
    base_delay: Duration,
  ) -> Option<Reading> {
    self.run(indicator, urls, max_attempts, base_delay).await.ok()
  }

  /// Like [`EndpointOrchestrator::try_endpoints`] but keeps the failure details.
  ///
  /// Every failed HTTP attempt of an exhausted endpoint counts as one breaker
  /// failure. A success resets the breaker.
  pub async fn run(
    &self,
    indicator: &str,
    urls: &[String],
    max_attempts: u32,
    base_delay: Duration,
  ) -> Result<Reading, EndpointsExhausted> {
    let mut attempts = 0;
    let mut last = None;

    for url in urls {
      match self
        .engine
        .attempt_with_retry(url, max_attempts, base_delay)
        .await
      {
        Ok(reading) => {
          self.ledger.record_success(indicator);
          info!(indicator, url = %url, value = reading.value, period = %reading.period, "live value fetched");
          return Ok(reading);
        }
        Err(exhausted) => {
          attempts += exhausted.attempts;
          for _ in 0..exhausted.attempts {
            self.ledger.record_failure(indicator);
          }
          warn!(indicator, url = %url, error = %exhausted, "endpoint exhausted, trying next");
          last = Some(exhausted);
        }
      }
    }

    let exhausted = EndpointsExhausted {
      indicator: indicator.to_string(),
      endpoints: urls.len(),
      attempts,
      last,
    };
    warn!(indicator, attempts, "all endpoints failed");
    Err(exhausted)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::BreakerConfig;
  use crate::indicators::client::fake::{FakeTransport, Step};
  use crate::storage::{KeyValueStore, SqliteStore};
  use serde_json::json;

  const BASE: Duration = Duration::from_millis(500);

  struct Harness {
    orchestrator: EndpointOrchestrator<FakeTransport>,
    transport: Arc<FakeTransport>,
    ledger: Arc<BreakerLedger>,
    session: Arc<SqliteStore>,
  }

  fn harness(transport: FakeTransport) -> Harness {
    let transport = Arc::new(transport);
    let session = Arc::new(SqliteStore::in_memory().unwrap());
    let ledger = Arc::new(BreakerLedger::new(session.clone(), BreakerConfig::default()));
    let engine = RetryEngine::new(transport.clone(), Duration::from_secs(5));

    Harness {
      orchestrator: EndpointOrchestrator::new(engine, ledger.clone()),
      transport,
      ledger,
      session,
    }
  }

  fn urls(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
  }

  #[tokio::test(start_paused = true)]
  async fn test_third_endpoint_succeeds() {
    let h = harness(
      FakeTransport::new()
        .on("url1", Step::reject("Falha endpoint 1"))
        .on("url2", Step::reject("Falha endpoint 2"))
        .on("url3", Step::ok(json!([{}, {"V": "8.1", "D2N": "2022"}]))),
    );

    let result = h
      .orchestrator
      .try_endpoints("pobreza", &urls(&["url1", "url2", "url3"]), 1, BASE)
      .await;

    assert_eq!(result, Some(Reading::new(8.1, 2022)));
    assert_eq!(h.transport.calls(), urls(&["url1", "url2", "url3"]));
  }

  #[tokio::test(start_paused = true)]
  async fn test_first_two_calls_fail_then_succeed_with_defaults() {
    let h = harness(
      FakeTransport::new()
        .then(Step::reject("Falha endpoint 1"))
        .then(Step::reject("Falha endpoint 2"))
        .then(Step::ok(json!([{}, {"V": "8.1", "D2N": "2022"}]))),
    );

    let result = h
      .orchestrator
      .try_endpoints("energia", &urls(&["url1", "url2", "url3"]), 3, BASE)
      .await;

    assert_eq!(result, Some(Reading::new(8.1, 2022)));
    assert_eq!(h.transport.call_count(), 3);
    // three calls all went to url1, which succeeded on its third attempt
    assert_eq!(h.transport.calls(), urls(&["url1", "url1", "url1"]));
  }

  #[tokio::test(start_paused = true)]
  async fn test_all_fail_counts_every_attempt() {
    let h = harness(FakeTransport::new().otherwise(Step::reject("Falha endpoint")));

    let result = h
      .orchestrator
      .try_endpoints("energia", &urls(&["url1", "url2", "url3"]), 1, BASE)
      .await;

    assert_eq!(result, None);
    let raw = h.session.get("circuit_breaker_energia").unwrap().unwrap();
    let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(json["falhas"], 3);
    assert_eq!(json["ativo"], true);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failure_count_equals_total_attempts() {
    let h = harness(FakeTransport::new().otherwise(Step::reject("down")));

    let err = h
      .orchestrator
      .run("saneamento", &urls(&["url1", "url2"]), 3, BASE)
      .await
      .unwrap_err();

    assert_eq!(err.attempts, 6);
    assert_eq!(err.endpoints, 2);
    assert_eq!(h.transport.call_count(), 6);
    assert_eq!(h.ledger.state("saneamento").unwrap().failure_count, 6);
    assert_eq!(err.last.unwrap().url, "url2");
  }

  #[tokio::test(start_paused = true)]
  async fn test_no_extra_delay_between_endpoints() {
    let h = harness(FakeTransport::new().otherwise(Step::reject("down")));
    let started = tokio::time::Instant::now();

    h.orchestrator
      .run("x", &urls(&["url1", "url2"]), 2, BASE)
      .await
      .unwrap_err();

    // 500ms inside each endpoint's budget, nothing in between
    assert_eq!(started.elapsed(), Duration::from_millis(1000));
    let times = h.transport.call_times();
    assert_eq!(times[2] - times[1], Duration::ZERO);
  }

  #[tokio::test(start_paused = true)]
  async fn test_success_resets_breaker() {
    let h = harness(
      FakeTransport::new()
        .on("url1", Step::reject("down"))
        .on("url2", Step::ok(json!([{}, {"V": "1", "D2N": "2020"}]))),
    );
    h.ledger.record_failure("x");
    h.ledger.record_failure("x");

    let result = h
      .orchestrator
      .try_endpoints("x", &urls(&["url1", "url2"]), 1, BASE)
      .await;

    assert!(result.is_some());
    assert_eq!(h.ledger.state("x"), None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_empty_endpoint_list() {
    let h = harness(FakeTransport::new());

    let err = h.orchestrator.run("x", &[], 3, BASE).await.unwrap_err();

    assert_eq!(err.attempts, 0);
    assert!(err.last.is_none());
    assert_eq!(h.transport.call_count(), 0);
    assert_eq!(h.ledger.state("x"), None);
    assert!(err.reason().contains("no endpoints"));
  }
}
