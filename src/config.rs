use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Custom title for the dashboard output
  pub title: Option<String>,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub resilience: ResilienceConfig,
  #[serde(default)]
  pub snapshot: SnapshotConfig,
  #[serde(default)]
  pub indicators: Vec<IndicatorConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
  /// Durable store location (default: <data_dir>/store.db)
  pub path: Option<PathBuf>,
  /// Breaker ledger location. Unset keeps it in memory for this session only.
  pub session_path: Option<PathBuf>,
  /// When false, nothing is cached and the error journal is not kept
  #[serde(default = "default_true")]
  pub enabled: bool,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      path: None,
      session_path: None,
      enabled: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// TTL for live and snapshot results
  pub ttl_ms: u64,
  /// TTL for historical fallback results, short so the network is retried soon
  pub fallback_ttl_ms: u64,
  /// Largest serialized value the store accepts
  pub max_value_bytes: usize,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_ms: 24 * 60 * 60 * 1000,
      fallback_ttl_ms: 5 * 60 * 1000,
      max_value_bytes: 64 * 1024,
    }
  }
}

impl CacheConfig {
  pub fn ttl(&self) -> Duration {
    Duration::from_millis(self.ttl_ms)
  }

  pub fn fallback_ttl(&self) -> Duration {
    Duration::from_millis(self.fallback_ttl_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
  /// Attempts per endpoint
  pub max_attempts: u32,
  /// Delay before the second attempt; doubles after each failure
  pub base_delay_ms: u64,
  /// Upper bound for a single backoff delay
  pub max_delay_ms: u64,
  /// Deadline for one HTTP attempt
  pub request_timeout_ms: u64,
  pub breaker: BreakerConfig,
}

impl Default for ResilienceConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay_ms: 500,
      max_delay_ms: 30_000,
      request_timeout_ms: 5_000,
      breaker: BreakerConfig::default(),
    }
  }
}

impl ResilienceConfig {
  pub fn base_delay(&self) -> Duration {
    Duration::from_millis(self.base_delay_ms)
  }

  pub fn max_delay(&self) -> Duration {
    Duration::from_millis(self.max_delay_ms)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_millis(self.request_timeout_ms)
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BreakerPolicy {
  /// Skip the network while open; allow one trial chain once the open window elapses
  #[default]
  Gate,
  /// Only record outcomes; always attempt the network
  Record,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
  /// Consecutive failed attempts that open the breaker
  pub threshold: u32,
  /// How long an open breaker blocks attempts under the gate policy
  pub open_window_ms: u64,
  pub policy: BreakerPolicy,
}

impl Default for BreakerConfig {
  fn default() -> Self {
    Self {
      threshold: 3,
      open_window_ms: 30_000,
      policy: BreakerPolicy::Gate,
    }
  }
}

impl BreakerConfig {
  pub fn open_window(&self) -> Duration {
    Duration::from_millis(self.open_window_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
  /// Tried in order. Each is an http(s) base URL or a directory holding `<indicator>.json`.
  pub locations: Vec<String>,
  /// Snapshots older than this are ignored
  pub max_age_days: i64,
}

impl Default for SnapshotConfig {
  fn default() -> Self {
    Self {
      locations: vec!["dados/indicadores".to_string(), "dados".to_string()],
      max_age_days: 30,
    }
  }
}

/// One indicator and where to get it.
#[derive(Debug, Clone, Deserialize)]
pub struct IndicatorConfig {
  /// Key used for cache entries, breaker state and snapshot file names
  pub name: String,
  pub title: Option<String>,
  /// Candidate URLs, tried in order
  #[serde(default)]
  pub endpoints: Vec<String>,
  /// Historical series ordered by year, last point used as fallback
  #[serde(default)]
  pub history: Vec<HistoryPoint>,
}

impl IndicatorConfig {
  /// Most recent point of the historical series.
  pub fn latest_history(&self) -> Option<&HistoryPoint> {
    self.history.iter().max_by_key(|point| point.year)
  }

  pub fn display_title(&self) -> &str {
    self.title.as_deref().unwrap_or(&self.name)
  }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct HistoryPoint {
  pub year: i32,
  pub value: f64,
}

fn default_true() -> bool {
  true
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./painel-ods.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/painel-ods/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/painel-ods/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("painel-ods.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("painel-ods").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml_str(&contents)
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  /// Parse and validate a YAML document.
  pub fn from_yaml_str(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;

    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    let mut seen = BTreeSet::new();

    for indicator in &self.indicators {
      if indicator.name.trim().is_empty() {
        return Err(eyre!("Indicator with empty name"));
      }
      if indicator.name == "erros" {
        return Err(eyre!("Indicator name \"erros\" is reserved for the error journal"));
      }
      if !seen.insert(indicator.name.as_str()) {
        return Err(eyre!("Indicator {} is defined twice", indicator.name));
      }
      for endpoint in &indicator.endpoints {
        url::Url::parse(endpoint)
          .map_err(|e| eyre!("Invalid endpoint {} for {}: {}", endpoint, indicator.name, e))?;
      }
    }

    if self.resilience.max_attempts == 0 {
      return Err(eyre!("resilience.max_attempts must be at least 1"));
    }
    if self.resilience.breaker.threshold == 0 {
      return Err(eyre!("resilience.breaker.threshold must be at least 1"));
    }
    if self.snapshot.max_age_days < 0 {
      return Err(eyre!("snapshot.max_age_days must not be negative"));
    }

    Ok(())
  }

  pub fn indicator(&self, name: &str) -> Option<&IndicatorConfig> {
    self.indicators.iter().find(|i| i.name == name)
  }

  /// Directory for the durable store and log files.
  ///
  /// Checks PAINEL_ODS_DATA_DIR first, then the platform data directory.
  pub fn data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("PAINEL_ODS_DATA_DIR") {
      return Ok(PathBuf::from(dir));
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("painel-ods"))
  }
}
