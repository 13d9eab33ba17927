//! Tracing setup. Logs go to a daily rolling file so stdout stays free
//! for command output.

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter read from the environment, e.g. `PAINEL_ODS_LOG=painel_ods=debug`
pub const LOG_ENV: &str = "PAINEL_ODS_LOG";

const DEFAULT_FILTER: &str = "painel_ods=info";

/// Install the global subscriber writing to `<log_dir>/painel-ods.log.<date>`.
///
/// Keep the returned guard alive for the whole run; dropping it flushes
/// and stops the writer thread.
pub fn init(log_dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(log_dir, "painel-ods.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

  tracing_subscriber::registry()
    .with(filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false),
    )
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
