//! Static snapshot reader.
//!
//! A snapshot is a pre-generated `<indicator>.json` file. A fresh one
//! short-circuits the whole network pipeline; a missing, malformed or stale
//! one just means "go live".

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::api_types::{parse_number, parse_period, ApiSnapshotFile};
use super::client::Transport;
use super::types::{IndicatorData, Period, Reading};

/// Where snapshot files are looked up.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotLocation {
  /// Base URL, fetched through the transport
  Http(Url),
  /// Local directory
  Dir(PathBuf),
}

impl SnapshotLocation {
  /// `http(s)://` strings become URLs, anything else is a directory.
  pub fn parse(location: &str) -> Self {
    match Url::parse(location) {
      Ok(url) if matches!(url.scheme(), "http" | "https") => {
        // Url::join replaces the last segment unless the base ends with '/'
        let url = if url.path().ends_with('/') {
          url
        } else {
          let mut with_slash = url.clone();
          with_slash.set_path(&format!("{}/", url.path()));
          with_slash
        };
        SnapshotLocation::Http(url)
      }
      _ => SnapshotLocation::Dir(PathBuf::from(location)),
    }
  }
}

pub struct SnapshotReader<T: Transport> {
  transport: Arc<T>,
  locations: Vec<SnapshotLocation>,
  max_age_days: i64,
  timeout: Duration,
}

impl<T: Transport> SnapshotReader<T> {
  pub fn new(transport: Arc<T>, locations: Vec<SnapshotLocation>, max_age_days: i64) -> Self {
    Self {
      transport,
      locations,
      max_age_days,
      timeout: Duration::from_secs(5),
    }
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  /// Serve a fresh snapshot for `indicator`, or `None` to fall through
  /// to the live pipeline.
  pub async fn read_snapshot(&self, indicator: &str) -> Option<IndicatorData> {
    let (location, raw) = self.find_file(indicator).await?;

    let file: ApiSnapshotFile = match serde_json::from_slice(&raw) {
      Ok(file) => file,
      Err(e) => {
        warn!(indicator, location = ?location, error = %e, "invalid snapshot structure");
        return None;
      }
    };

    let Some(value) = parse_number(&file.dados.valor) else {
      warn!(indicator, valor = %file.dados.valor, "snapshot value is not a finite number");
      return None;
    };

    let Some(updated_at) = parse_timestamp(&file.updated_at) else {
      warn!(indicator, updated_at = %file.updated_at, "unparseable snapshot timestamp");
      return None;
    };

    let age_days = (Utc::now() - updated_at).num_days();
    if age_days > self.max_age_days {
      info!(
        indicator,
        age_days,
        max_age_days = self.max_age_days,
        "snapshot too old, going live"
      );
      return None;
    }

    let period = file
      .dados
      .ano
      .as_ref()
      .and_then(parse_period)
      .unwrap_or(Period::Year(updated_at.year()));

    info!(indicator, updated_at = %updated_at, "serving snapshot");
    Some(IndicatorData::snapshot(
      indicator,
      Reading { value, period },
      updated_at,
    ))
  }

  /// First location that has the file wins.
  async fn find_file(&self, indicator: &str) -> Option<(&SnapshotLocation, Vec<u8>)> {
    let file_name = format!("{}.json", indicator);

    for location in &self.locations {
      let found = match location {
        SnapshotLocation::Http(base) => self.fetch_http(base, &file_name).await,
        SnapshotLocation::Dir(dir) => read_file(dir.join(&file_name)).await,
      };

      if let Some(raw) = found {
        return Some((location, raw));
      }
      debug!(indicator, location = ?location, "no snapshot at location");
    }

    None
  }

  async fn fetch_http(&self, base: &Url, file_name: &str) -> Option<Vec<u8>> {
    let url = base.join(file_name).ok()?;

    match tokio::time::timeout(self.timeout, self.transport.get(url.as_str())).await {
      Ok(Ok(response)) if response.is_success() => Some(response.body),
      Ok(Ok(_)) => None,
      Ok(Err(e)) => {
        debug!(url = %url, error = %e, "snapshot request failed");
        None
      }
      Err(_) => {
        debug!(url = %url, "snapshot request timed out");
        None
      }
    }
  }
}

async fn read_file(path: PathBuf) -> Option<Vec<u8>> {
  match tokio::fs::read(&path).await {
    Ok(raw) => Some(raw),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
    Err(e) => {
      warn!(path = %path.display(), error = %e, "failed to read snapshot file");
      None
    }
  }
}

/// Accepts RFC 3339, a naive date-time (taken as UTC) or a bare date.
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
  let s = s.trim();

  if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
    return Some(dt.with_timezone(&Utc));
  }
  if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
    return Some(dt.and_utc());
  }
  NaiveDate::parse_from_str(s, "%Y-%m-%d")
    .ok()
    .and_then(|d| d.and_hms_opt(0, 0, 0))
    .map(|dt| dt.and_utc())
}
