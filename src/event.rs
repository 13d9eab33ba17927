use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::indicators::{IndicatorData, IndicatorService, Transport};

/// Requests sent to the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DashboardCommand {
  /// Load every configured indicator
  FetchAll,
  /// Load one indicator
  Fetch { indicator: String },
  /// User pressed "retry" on a card: forget cache and breaker state, then load
  RetryRequested { indicator: String },
  /// Stop accepting commands
  Shutdown,
}

/// Results sent back to the page loop
#[derive(Debug, Clone, PartialEq)]
pub enum DashboardEvent {
  /// New data for a card (possibly a fallback value)
  IndicatorUpdated {
    indicator: String,
    data: Box<IndicatorData>,
  },
  /// The indicator could not be processed at all, e.g. it is not configured
  IndicatorFailed { indicator: String, error: String },
}

/// Runs commands against the indicator service on a background task and
/// streams the outcomes back.
pub struct Dispatcher {
  command_tx: mpsc::UnboundedSender<DashboardCommand>,
  event_rx: mpsc::UnboundedReceiver<DashboardEvent>,
}

impl Dispatcher {
  /// Spawn the dispatcher loop. Each fetch runs on its own task, so
  /// indicators load concurrently and events arrive in completion order.
  pub fn spawn<T: Transport>(service: IndicatorService<T>) -> Self {
    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      while let Some(command) = command_rx.recv().await {
        debug!(command = ?command, "dispatching");
        match command {
          DashboardCommand::FetchAll => {
            for indicator in service.indicators() {
              spawn_fetch(&service, &event_tx, indicator.name.clone(), false);
            }
          }
          DashboardCommand::Fetch { indicator } => {
            spawn_fetch(&service, &event_tx, indicator, false);
          }
          DashboardCommand::RetryRequested { indicator } => {
            info!(indicator = %indicator, "retry requested");
            spawn_fetch(&service, &event_tx, indicator, true);
          }
          DashboardCommand::Shutdown => break,
        }
      }
    });

    Self {
      command_tx,
      event_rx,
    }
  }

  /// Queue a command. Returns false once the dispatcher has shut down.
  pub fn send(&self, command: DashboardCommand) -> bool {
    self.command_tx.send(command).is_ok()
  }

  /// Receive the next event. `None` after shutdown once every pending
  /// fetch has reported.
  pub async fn next(&mut self) -> Option<DashboardEvent> {
    self.event_rx.recv().await
  }
}

fn spawn_fetch<T: Transport>(
  service: &IndicatorService<T>,
  tx: &mpsc::UnboundedSender<DashboardEvent>,
  indicator: String,
  retry: bool,
) {
  let service = service.clone();
  let tx = tx.clone();

  tokio::spawn(async move {
    let result = if retry {
      service.retry_indicator(&indicator).await
    } else {
      service.fetch_indicator(&indicator).await
    };

    let event = match result {
      Ok(data) => DashboardEvent::IndicatorUpdated {
        indicator,
        data: Box::new(data),
      },
      Err(e) => DashboardEvent::IndicatorFailed {
        indicator,
        error: e.to_string(),
      },
    };
    let _ = tx.send(event);
  });
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;
  use crate::indicators::client::fake::{FakeTransport, Step};
  use crate::indicators::DataOrigin;
  use crate::storage::SqliteStore;
  use serde_json::json;
  use std::collections::HashSet;
  use std::sync::Arc;

  const CONFIG: &str = r#"
resilience:
  max_attempts: 1
snapshot:
  locations: []
indicators:
  - name: pobreza
    endpoints: [https://apisidra.ibge.gov.br/values/t/1]
    history: [{ year: 2022, value: 8.1 }]
  - name: educacao
    endpoints: [https://apisidra.ibge.gov.br/values/t/2]
    history: [{ year: 2022, value: 88.8 }]
"#;

  fn dispatcher(transport: FakeTransport) -> (Dispatcher, IndicatorService<FakeTransport>) {
    let config = Config::from_yaml_str(CONFIG).unwrap();
    let service = IndicatorService::new(
      &config,
      Arc::new(transport),
      Arc::new(SqliteStore::in_memory().unwrap()),
      Arc::new(SqliteStore::in_memory().unwrap()),
    );
    (Dispatcher::spawn(service.clone()), service)
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_all_reports_every_indicator() {
    let (mut dispatcher, _) =
      dispatcher(FakeTransport::new().otherwise(Step::ok(json!([{}, {"V": "1", "D2N": "2023"}]))));

    assert!(dispatcher.send(DashboardCommand::FetchAll));

    let mut seen = HashSet::new();
    for _ in 0..2 {
      match dispatcher.next().await.unwrap() {
        DashboardEvent::IndicatorUpdated { indicator, data } => {
          assert_eq!(data.origin, DataOrigin::Live);
          seen.insert(indicator);
        }
        other => panic!("unexpected event {:?}", other),
      }
    }
    assert_eq!(seen, HashSet::from(["pobreza".to_string(), "educacao".to_string()]));
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_request_clears_breaker_and_refetches() {
    let (mut dispatcher, service) =
      dispatcher(FakeTransport::new().otherwise(Step::ok(json!([{}, {"V": "7.5", "D2N": "2023"}]))));
    for _ in 0..3 {
      service.ledger().record_failure("pobreza");
    }

    dispatcher.send(DashboardCommand::RetryRequested {
      indicator: "pobreza".to_string(),
    });

    match dispatcher.next().await.unwrap() {
      DashboardEvent::IndicatorUpdated { data, .. } => {
        assert_eq!(data.origin, DataOrigin::Live);
        assert!(!data.used_fallback());
      }
      other => panic!("unexpected event {:?}", other),
    }
    assert!(!service.ledger().is_open("pobreza"));
  }

  #[tokio::test]
  async fn test_unknown_indicator_fails() {
    let (mut dispatcher, _) = dispatcher(FakeTransport::new());

    dispatcher.send(DashboardCommand::Fetch {
      indicator: "nope".to_string(),
    });

    assert!(matches!(
      dispatcher.next().await,
      Some(DashboardEvent::IndicatorFailed { .. })
    ));
  }

  #[tokio::test]
  async fn test_shutdown_closes_event_stream() {
    let (mut dispatcher, service) = dispatcher(FakeTransport::new());
    drop(service);

    dispatcher.send(DashboardCommand::Shutdown);

    assert_eq!(dispatcher.next().await, None);
  }
}
