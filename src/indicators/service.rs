//! Indicator service: the layered fetch pipeline behind every dashboard card.
//!
//! Layers, first hit wins:
//! 1. cached pipeline result (`ods_sergipe_<indicator>`)
//! 2. fresh static snapshot
//! 3. breaker gate
//! 4. live endpoints with retries
//! 5. latest point of the configured historical series

use color_eyre::{eyre::eyre, Result};
use futures::future::{join_all, AbortHandle, Abortable, BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::client::{HttpTransport, Transport};
use super::journal::ErrorJournal;
use super::snapshot::{SnapshotLocation, SnapshotReader};
use super::types::{IndicatorData, Reading};
use crate::cache::{result_key, CacheStore};
use crate::config::{Config, IndicatorConfig};
use crate::resilience::{BreakerLedger, EndpointOrchestrator, RetryEngine};
use crate::storage::{KeyValueStore, NoopStore, SqliteStore};

/// A pipeline run shared by every concurrent caller. `None` when the run
/// was superseded by a user retry.
type PendingFetch = Shared<BoxFuture<'static, Option<IndicatorData>>>;

struct Run {
  pending: PendingFetch,
  abort: AbortHandle,
}

/// Runs in flight plus a per-indicator generation, bumped on every reset.
/// A run only writes the cache while its generation is current.
#[derive(Default)]
struct RunTable {
  runs: HashMap<String, Run>,
  generations: HashMap<String, u64>,
}

impl RunTable {
  fn generation(&self, name: &str) -> u64 {
    self.generations.get(name).copied().unwrap_or(0)
  }
}

/// Fetches indicator data through the full pipeline.
///
/// Cheap to clone; clones share the cache, the breaker ledger and the
/// in-flight map.
pub struct IndicatorService<T: Transport> {
  inner: Arc<ServiceInner<T>>,
}

impl<T: Transport> Clone for IndicatorService<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

struct ServiceInner<T: Transport> {
  indicators: Vec<IndicatorConfig>,
  max_attempts: u32,
  base_delay: Duration,
  fallback_ttl: Duration,
  cache: CacheStore,
  ledger: Arc<BreakerLedger>,
  orchestrator: EndpointOrchestrator<T>,
  snapshots: SnapshotReader<T>,
  journal: ErrorJournal,
  in_flight: Mutex<RunTable>,
}

impl IndicatorService<HttpTransport> {
  /// Build the production service: HTTP transport, SQLite storage.
  pub fn from_config(config: &Config) -> Result<Self> {
    let transport = Arc::new(HttpTransport::new()?);

    let durable: Arc<dyn KeyValueStore> = if config.storage.enabled {
      let path = match &config.storage.path {
        Some(path) => path.clone(),
        None => SqliteStore::default_path(&Config::data_dir()?),
      };
      Arc::new(SqliteStore::open(&path)?.with_max_value_bytes(config.cache.max_value_bytes))
    } else {
      Arc::new(NoopStore)
    };

    let session: Arc<dyn KeyValueStore> = match &config.storage.session_path {
      Some(path) => Arc::new(SqliteStore::open(path)?),
      None => Arc::new(SqliteStore::in_memory()?),
    };

    Ok(Self::new(config, transport, durable, session))
  }
}

impl<T: Transport> IndicatorService<T> {
  /// Wire the pipeline over the given transport and stores.
  ///
  /// `durable` holds the cache and error journal, `session` the breaker ledger.
  pub fn new(
    config: &Config,
    transport: Arc<T>,
    durable: Arc<dyn KeyValueStore>,
    session: Arc<dyn KeyValueStore>,
  ) -> Self {
    let resilience = &config.resilience;

    let ledger = Arc::new(BreakerLedger::new(session, resilience.breaker.clone()));
    let engine = RetryEngine::new(transport.clone(), resilience.request_timeout())
      .with_max_delay(resilience.max_delay());
    let locations = config
      .snapshot
      .locations
      .iter()
      .map(|location| SnapshotLocation::parse(location))
      .collect();

    let inner = ServiceInner {
      indicators: config.indicators.clone(),
      max_attempts: resilience.max_attempts,
      base_delay: resilience.base_delay(),
      fallback_ttl: config.cache.fallback_ttl(),
      cache: CacheStore::new(durable.clone()).with_default_ttl(config.cache.ttl()),
      orchestrator: EndpointOrchestrator::new(engine, ledger.clone()),
      ledger,
      snapshots: SnapshotReader::new(transport, locations, config.snapshot.max_age_days)
        .with_timeout(resilience.request_timeout()),
      journal: ErrorJournal::new(durable),
      in_flight: Mutex::new(RunTable::default()),
    };

    Self {
      inner: Arc::new(inner),
    }
  }

  pub fn indicators(&self) -> &[IndicatorConfig] {
    &self.inner.indicators
  }

  pub fn cache(&self) -> &CacheStore {
    &self.inner.cache
  }

  pub fn ledger(&self) -> &BreakerLedger {
    &self.inner.ledger
  }

  pub fn journal(&self) -> &ErrorJournal {
    &self.inner.journal
  }

  /// Data for one indicator. Never fails for a configured indicator: when
  /// nothing live is available the result carries the fallback value (or no
  /// value) and an error message instead.
  ///
  /// Concurrent calls for the same indicator share one pipeline run. A caller
  /// whose run is superseded by a retry joins the newer run.
  pub async fn fetch_indicator(&self, name: &str) -> Result<IndicatorData> {
    let indicator = self
      .inner
      .indicator(name)
      .ok_or_else(|| eyre!("Unknown indicator: {}", name))?;

    loop {
      let pending = self.join_or_start(indicator);
      let result = pending.clone().await;

      {
        let mut table = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if table
          .runs
          .get(name)
          .is_some_and(|run| Shared::ptr_eq(&run.pending, &pending))
        {
          table.runs.remove(name);
        }
      }

      match result {
        Some(data) => return Ok(data),
        None => debug!(indicator = name, "run superseded, joining the newer one"),
      }
    }
  }

  fn join_or_start(&self, indicator: &IndicatorConfig) -> PendingFetch {
    let name = indicator.name.as_str();
    let mut table = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());

    if let Some(run) = table.runs.get(name) {
      debug!(indicator = name, "joining in-flight fetch");
      return run.pending.clone();
    }

    let generation = table.generation(name);
    let inner = Arc::clone(&self.inner);
    let indicator = indicator.clone();
    let (abort, registration) = AbortHandle::new_pair();
    let pending = Abortable::new(
      async move { inner.load(&indicator, generation).await },
      registration,
    )
    .map(|result| result.ok())
    .boxed()
    .shared();

    table.runs.insert(
      name.to_string(),
      Run {
        pending: pending.clone(),
        abort,
      },
    );
    pending
  }

  /// Fetch every configured indicator concurrently, in configuration order.
  pub async fn fetch_all(&self) -> Vec<IndicatorData> {
    let fetches = self
      .inner
      .indicators
      .iter()
      .map(|indicator| self.fetch_indicator(&indicator.name));

    join_all(fetches)
      .await
      .into_iter()
      .filter_map(|result| match result {
        Ok(data) => Some(data),
        Err(e) => {
          warn!(error = %e, "fetch failed");
          None
        }
      })
      .collect()
  }

  /// Forget the cached result and breaker state of `name`, then fetch again.
  pub async fn retry_indicator(&self, name: &str) -> Result<IndicatorData> {
    self.reset_indicator(name)?;
    self.fetch_indicator(name).await
  }

  /// Forget the cached result and breaker state of `name`.
  ///
  /// A run already in flight is aborted and can no longer write the cache;
  /// its callers move on to the next run.
  pub fn reset_indicator(&self, name: &str) -> Result<()> {
    if self.inner.indicator(name).is_none() {
      return Err(eyre!("Unknown indicator: {}", name));
    }

    {
      let mut table = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
      *table.generations.entry(name.to_string()).or_insert(0) += 1;
      if let Some(run) = table.runs.remove(name) {
        run.abort.abort();
        debug!(indicator = name, "in-flight fetch aborted");
      }
    }

    self.inner.cache.invalidate(&result_key(name));
    self.inner.ledger.clear(name);
    info!(indicator = name, "cache and breaker state cleared");
    Ok(())
  }
}

impl<T: Transport> ServiceInner<T> {
  fn indicator(&self, name: &str) -> Option<&IndicatorConfig> {
    self.indicators.iter().find(|i| i.name == name)
  }

  fn is_current(&self, name: &str, generation: u64) -> bool {
    let table = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
    table.generation(name) == generation
  }

  /// Cache `data` unless a reset happened since this run started.
  fn remember(&self, name: &str, generation: u64, data: &IndicatorData, ttl: Duration) {
    if self.is_current(name, generation) {
      self.cache.set(&result_key(name), data, ttl);
    } else {
      debug!(indicator = name, "stale run, result not cached");
    }
  }

  async fn load(&self, indicator: &IndicatorConfig, generation: u64) -> IndicatorData {
    let name = indicator.name.as_str();
    let key = result_key(name);

    if let Some(mut data) = self.cache.get::<IndicatorData>(&key) {
      debug!(indicator = name, origin = ?data.origin, "cache hit");
      data.from_cache = true;
      return data;
    }

    if let Some(data) = self.snapshots.read_snapshot(name).await {
      self.remember(name, generation, &data, self.cache.default_ttl());
      return data;
    }

    if !self.ledger.allows_attempt(name) {
      info!(indicator = name, "circuit breaker open, skipping network");
      return self.fall_back(indicator, generation, "circuit breaker open".to_string());
    }

    match self
      .orchestrator
      .run(name, &indicator.endpoints, self.max_attempts, self.base_delay)
      .await
    {
      Ok(reading) => {
        let data = IndicatorData::live(name, reading);
        self.remember(name, generation, &data, self.cache.default_ttl());
        data
      }
      Err(exhausted) => {
        let reason = exhausted.reason();
        if self.is_current(name, generation) {
          self.journal.append(name, &reason);
        }
        self.fall_back(indicator, generation, reason)
      }
    }
  }

  fn fall_back(&self, indicator: &IndicatorConfig, generation: u64, reason: String) -> IndicatorData {
    let name = indicator.name.as_str();

    let Some(point) = indicator.latest_history() else {
      warn!(indicator = name, reason = %reason, "no data available");
      return IndicatorData::unavailable(name, reason);
    };

    info!(indicator = name, year = point.year, "using historical fallback");
    let data = IndicatorData::fallback(name, Reading::new(point.value, point.year), reason);
    self.remember(name, generation, &data, self.fallback_ttl);
    data
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::indicators::client::fake::{FakeTransport, Step};
  use crate::indicators::types::DataOrigin;
  use crate::storage::failing::BrokenStore;
  use chrono::Utc;
  use serde_json::json;
  use std::path::Path;

  struct Harness {
    service: IndicatorService<FakeTransport>,
    transport: Arc<FakeTransport>,
    durable: Arc<SqliteStore>,
    snapshot_dir: tempfile::TempDir,
  }

  const CONFIG: &str = r#"
resilience:
  max_attempts: 1
  base_delay_ms: 500
  request_timeout_ms: 5000
indicators:
  - name: pobreza
    endpoints:
      - https://apisidra.ibge.gov.br/values/t/6691
      - https://apisidra.ibge.gov.br/values/t/6692
      - https://apisidra.ibge.gov.br/values/t/6693
    history:
      - { year: 2021, value: 9.3 }
      - { year: 2022, value: 8.1 }
  - name: energia_solar
    endpoints:
      - https://apisidra.ibge.gov.br/values/t/9999
"#;

  fn harness(transport: FakeTransport) -> Harness {
    harness_with(CONFIG, transport)
  }

  fn harness_with(yaml: &str, transport: FakeTransport) -> Harness {
    let snapshots = tempfile::tempdir().unwrap();
    let mut config = Config::from_yaml_str(yaml).unwrap();
    config.snapshot.locations = vec![snapshots.path().display().to_string()];

    let transport = Arc::new(transport);
    let durable = Arc::new(SqliteStore::in_memory().unwrap());
    let session = Arc::new(SqliteStore::in_memory().unwrap());
    let service = IndicatorService::new(&config, transport.clone(), durable.clone(), session);

    Harness {
      service,
      transport,
      durable,
      snapshot_dir: snapshots,
    }
  }

  fn write_snapshot(dir: &Path, indicator: &str, age_days: i64, valor: f64) {
    let updated = Utc::now() - chrono::Duration::days(age_days);
    let body = json!({"ultimaAtualizacao": updated.to_rfc3339(), "dados": {"valor": valor, "ano": 2024}});
    std::fs::write(dir.join(format!("{}.json", indicator)), body.to_string()).unwrap();
  }

  fn sidra(value: &str, period: &str) -> serde_json::Value {
    json!([{}, {"V": value, "D2N": period}])
  }

  #[tokio::test(start_paused = true)]
  async fn test_third_endpoint_is_live_value() {
    let h = harness(
      FakeTransport::new()
        .on("https://apisidra.ibge.gov.br/values/t/6691", Step::reject("Falha endpoint 1"))
        .on("https://apisidra.ibge.gov.br/values/t/6692", Step::reject("Falha endpoint 2"))
        .on("https://apisidra.ibge.gov.br/values/t/6693", Step::ok(sidra("8.1", "2022"))),
    );

    let data = h.service.fetch_indicator("pobreza").await.unwrap();

    assert_eq!(data.origin, DataOrigin::Live);
    assert!(!data.used_fallback());
    assert_eq!(data.reading, Some(Reading::new(8.1, 2022)));
    assert_eq!(h.transport.call_count(), 3);
    assert!(h.durable.get("ods_sergipe_pobreza").unwrap().is_some());
    assert_eq!(h.service.ledger().state("pobreza"), None);
  }

  #[tokio::test]
  async fn test_fresh_snapshot_skips_network() {
    let h = harness(FakeTransport::new());
    write_snapshot(h.snapshot_dir.path(), "pobreza", 1, 7.9);

    let data = h.service.fetch_indicator("pobreza").await.unwrap();

    assert_eq!(data.origin, DataOrigin::Snapshot);
    assert_eq!(data.reading, Some(Reading::new(7.9, 2024)));
    assert_eq!(h.transport.call_count(), 0);
    assert_eq!(h.service.ledger().state("pobreza"), None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_snapshot_goes_live() {
    let h = harness(FakeTransport::new().otherwise(Step::ok(sidra("8.0", "2023"))));
    write_snapshot(h.snapshot_dir.path(), "pobreza", 45, 7.9);

    let data = h.service.fetch_indicator("pobreza").await.unwrap();

    assert_eq!(data.origin, DataOrigin::Live);
    assert_eq!(data.reading, Some(Reading::new(8.0, 2023)));
    assert_eq!(h.transport.call_count(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_all_endpoints_down_uses_history() {
    let h = harness(FakeTransport::new().otherwise(Step::reject("Falha endpoint")));

    let data = h.service.fetch_indicator("pobreza").await.unwrap();

    assert_eq!(data.origin, DataOrigin::Fallback);
    assert!(data.used_fallback());
    assert_eq!(data.reading, Some(Reading::new(8.1, 2022)));
    assert!(data.error.is_some());

    let breaker = h.service.ledger().state("pobreza").unwrap();
    assert_eq!(breaker.failure_count, 3);
    assert!(breaker.is_open);

    let journal = h.service.journal().entries();
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].indicator, "pobreza");
  }

  #[tokio::test(start_paused = true)]
  async fn test_no_history_is_unavailable_and_not_cached() {
    let h = harness(FakeTransport::new().otherwise(Step::reject("down")));

    let data = h.service.fetch_indicator("energia_solar").await.unwrap();

    assert_eq!(data.origin, DataOrigin::Unavailable);
    assert!(data.reading.is_none());
    assert!(data.error.is_some());
    assert!(h.durable.get("ods_sergipe_energia_solar").unwrap().is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_cached_result_is_served() {
    let h = harness(FakeTransport::new().then(Step::ok(sidra("8.1", "2022"))));

    let first = h.service.fetch_indicator("pobreza").await.unwrap();
    let second = h.service.fetch_indicator("pobreza").await.unwrap();

    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert_eq!(second.reading, first.reading);
    assert_eq!(h.transport.call_count(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_open_breaker_skips_network() {
    let h = harness(FakeTransport::new().otherwise(Step::reject("down")));
    for _ in 0..3 {
      h.service.ledger().record_failure("pobreza");
    }

    let data = h.service.fetch_indicator("pobreza").await.unwrap();

    assert_eq!(data.origin, DataOrigin::Fallback);
    assert_eq!(h.transport.call_count(), 0);
    // skipping is not a new failure
    assert!(h.service.journal().entries().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_fetches_share_one_run() {
    let h = harness(
      FakeTransport::new().otherwise(Step::Hang(Duration::from_millis(200), sidra("8.1", "2022"))),
    );

    let (a, b) = tokio::join!(
      h.service.fetch_indicator("pobreza"),
      h.service.fetch_indicator("pobreza")
    );

    assert_eq!(a.unwrap().reading, b.unwrap().reading);
    assert_eq!(h.transport.call_count(), 1);
    assert!(h.service.inner.in_flight.lock().unwrap().runs.is_empty());
  }

  #[tokio::test]
  async fn test_unknown_indicator_is_an_error() {
    let h = harness(FakeTransport::new());
    assert!(h.service.fetch_indicator("nope").await.is_err());
    assert!(h.service.reset_indicator("nope").is_err());
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_clears_cache_and_breaker() {
    let h = harness(
      FakeTransport::new()
        .then(Step::reject("down"))
        .then(Step::reject("down"))
        .then(Step::reject("down"))
        .otherwise(Step::ok(sidra("8.3", "2023"))),
    );

    let first = h.service.fetch_indicator("pobreza").await.unwrap();
    assert_eq!(first.origin, DataOrigin::Fallback);
    assert!(h.service.ledger().is_open("pobreza"));

    let retried = h.service.retry_indicator("pobreza").await.unwrap();

    assert_eq!(retried.origin, DataOrigin::Live);
    assert_eq!(retried.reading, Some(Reading::new(8.3, 2023)));
    assert_eq!(h.service.ledger().state("pobreza"), None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_during_fetch_starts_a_fresh_run() {
    let h = harness(
      FakeTransport::new()
        .then(Step::Hang(Duration::from_secs(1), json!({"unexpected": true})))
        .otherwise(Step::ok(sidra("8.3", "2023"))),
    );

    let service = h.service.clone();
    let earlier = tokio::spawn(async move { service.fetch_indicator("pobreza").await });
    while h.transport.call_count() == 0 {
      tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let retried = h.service.retry_indicator("pobreza").await.unwrap();
    assert_eq!(retried.origin, DataOrigin::Live);
    assert_eq!(retried.reading, Some(Reading::new(8.3, 2023)));

    // the caller of the superseded run gets the fresh data too
    let earlier = earlier.await.unwrap().unwrap();
    assert_eq!(earlier.origin, DataOrigin::Live);

    tokio::time::sleep(Duration::from_secs(10)).await;
    let cached = h
      .service
      .cache()
      .get::<IndicatorData>("ods_sergipe_pobreza")
      .unwrap();
    assert_eq!(cached.origin, DataOrigin::Live);
    assert_eq!(h.service.ledger().state("pobreza"), None);
    assert!(h.service.journal().entries().is_empty());
    assert_eq!(h.transport.call_count(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reset_makes_running_fetch_stale() {
    let h = harness(FakeTransport::new());
    let inner = &h.service.inner;
    let generation = inner.in_flight.lock().unwrap().generation("pobreza");

    h.service.reset_indicator("pobreza").unwrap();
    let data = IndicatorData::live("pobreza", Reading::new(1.0, 2020));
    inner.remember("pobreza", generation, &data, Duration::from_secs(60));

    assert!(h.durable.get("ods_sergipe_pobreza").unwrap().is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_broken_session_store_still_fetches_live() {
    let mut config = Config::from_yaml_str(CONFIG).unwrap();
    config.snapshot.locations.clear();
    let transport = Arc::new(FakeTransport::new().otherwise(Step::ok(sidra("8.1", "2022"))));
    let service = IndicatorService::new(
      &config,
      transport,
      Arc::new(SqliteStore::in_memory().unwrap()),
      Arc::new(BrokenStore),
    );

    let data = service.fetch_indicator("pobreza").await.unwrap();

    assert_eq!(data.origin, DataOrigin::Live);
    assert_eq!(data.reading, Some(Reading::new(8.1, 2022)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_all_keeps_config_order() {
    let h = harness(FakeTransport::new().otherwise(Step::ok(sidra("1", "2020"))));

    let all = h.service.fetch_all().await;

    let names: Vec<_> = all.iter().map(|d| d.indicator.as_str()).collect();
    assert_eq!(names, vec!["pobreza", "energia_solar"]);
  }
}
