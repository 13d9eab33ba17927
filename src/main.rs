use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use painel_ods::cache::result_key;
use painel_ods::config::Config;
use painel_ods::event::{DashboardCommand, DashboardEvent, Dispatcher};
use painel_ods::indicators::{DataOrigin, IndicatorData, IndicatorService, Transport};
use painel_ods::logging;

#[derive(Parser, Debug)]
#[command(name = "painel-ods")]
#[command(about = "Fetch Sergipe SDG indicators with caching, retries and fallbacks")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/painel-ods/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Load indicators (all of them when none is given)
  Fetch { indicators: Vec<String> },
  /// Clear the cached result and breaker state of an indicator, then load it again
  Retry { indicator: String },
  /// Show breaker and cache state per indicator
  Status,
  /// Show the error journal
  Errors,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let _log_guard = logging::init(&Config::data_dir()?.join("logs"))?;
  tracing::info!(indicators = config.indicators.len(), "painel-ods starting");

  let service = IndicatorService::from_config(&config)?;
  let purged = service.cache().purge_expired();
  if purged > 0 {
    tracing::info!(purged, "expired cache entries removed");
  }

  if let Some(title) = &config.title {
    println!("{}\n", title);
  }

  match args.command {
    Command::Fetch { indicators } => fetch(service, indicators).await,
    Command::Retry { indicator } => retry(service, indicator).await,
    Command::Status => {
      status(&service);
      Ok(())
    }
    Command::Errors => {
      errors(&service);
      Ok(())
    }
  }
}

async fn fetch<T: Transport>(
  service: IndicatorService<T>,
  requested: Vec<String>,
) -> Result<()> {
  let names: Vec<String> = if requested.is_empty() {
    service.indicators().iter().map(|i| i.name.clone()).collect()
  } else {
    let mut seen = HashSet::new();
    requested
      .into_iter()
      .filter(|name| seen.insert(name.clone()))
      .collect()
  };

  let mut dispatcher = Dispatcher::spawn(service.clone());
  for name in &names {
    dispatcher.send(DashboardCommand::Fetch {
      indicator: name.clone(),
    });
  }

  let mut results = HashMap::new();
  while results.len() < names.len() {
    let Some(event) = dispatcher.next().await else {
      break;
    };
    let (name, line) = render_event(&service, event);
    results.insert(name, line);
  }
  dispatcher.send(DashboardCommand::Shutdown);

  print_header();
  for name in &names {
    if let Some(line) = results.remove(name) {
      println!("{}", line);
    }
  }

  Ok(())
}

async fn retry<T: Transport>(
  service: IndicatorService<T>,
  indicator: String,
) -> Result<()> {
  if service.indicators().iter().all(|i| i.name != indicator) {
    return Err(eyre!("Unknown indicator: {}", indicator));
  }

  let mut dispatcher = Dispatcher::spawn(service.clone());
  dispatcher.send(DashboardCommand::RetryRequested { indicator });

  let event = dispatcher
    .next()
    .await
    .ok_or_else(|| eyre!("Dispatcher stopped before reporting"))?;
  dispatcher.send(DashboardCommand::Shutdown);

  print_header();
  println!("{}", render_event(&service, event).1);
  Ok(())
}

fn status<T: Transport>(service: &IndicatorService<T>) {
  println!(
    "{:<24} {:>8} {:>8} {:<12} {}",
    "INDICATOR", "FAILURES", "BREAKER", "CACHED", "CACHED AT"
  );

  for indicator in service.indicators() {
    let breaker = service.ledger().state(&indicator.name).unwrap_or_default();
    let cached = service
      .cache()
      .get_entry::<IndicatorData>(&result_key(&indicator.name));

    let (origin, stored_at) = match &cached {
      Some(entry) => (
        origin_label(entry.value.origin),
        entry.stored_at.format("%Y-%m-%d %H:%M:%S").to_string(),
      ),
      None => ("-", "-".to_string()),
    };

    println!(
      "{:<24} {:>8} {:>8} {:<12} {}",
      indicator.name,
      breaker.failure_count,
      if breaker.is_open { "open" } else { "closed" },
      origin,
      stored_at
    );
  }
}

fn errors<T: Transport>(service: &IndicatorService<T>) {
  let entries = service.journal().entries();
  if entries.is_empty() {
    println!("No errors recorded.");
    return;
  }

  for entry in entries {
    println!(
      "{}  {:<24} {}",
      entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
      entry.indicator,
      entry.message
    );
  }
}

fn print_header() {
  println!(
    "{:<32} {:>10} {:<20} {:<12}",
    "INDICATOR", "VALUE", "PERIOD", "SOURCE"
  );
}

/// One table row for a dispatcher event, keyed by indicator name.
fn render_event<T: Transport>(
  service: &IndicatorService<T>,
  event: DashboardEvent,
) -> (String, String) {
  match event {
    DashboardEvent::IndicatorUpdated { indicator, data } => {
      let title = service
        .indicators()
        .iter()
        .find(|i| i.name == indicator)
        .map(|i| i.display_title().to_string())
        .unwrap_or_else(|| indicator.clone());

      let (value, period) = match &data.reading {
        Some(reading) => (format!("{:.2}", reading.value), reading.period.to_string()),
        None => ("-".to_string(), "-".to_string()),
      };

      let mut line = format!(
        "{:<32} {:>10} {:<20} {:<12}",
        title,
        value,
        period,
        origin_label(data.origin)
      );
      if data.from_cache {
        line.push_str(" (cached)");
      }
      if data.used_fallback() {
        line.push_str(&format!(
          "\n  data may be outdated, run `painel-ods retry {}`",
          indicator
        ));
      }

      (indicator, line)
    }
    DashboardEvent::IndicatorFailed { indicator, error } => {
      let line = format!("{:<32} error: {}", indicator, error);
      (indicator, line)
    }
  }
}

fn origin_label(origin: DataOrigin) -> &'static str {
  match origin {
    DataOrigin::Snapshot => "snapshot",
    DataOrigin::Live => "live",
    DataOrigin::Fallback => "historical",
    DataOrigin::Unavailable => "unavailable",
  }
}
