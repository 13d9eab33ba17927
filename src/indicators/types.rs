use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference period of a reading: a year when the label is numeric,
/// otherwise the upstream label as-is (e.g. "4º trimestre 2023").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Period {
  Year(i32),
  Label(String),
}

impl Period {
  pub fn parse(label: &str) -> Self {
    let label = label.trim();
    match label.parse::<i32>() {
      Ok(year) => Period::Year(year),
      Err(_) => Period::Label(label.to_string()),
    }
  }
}

impl fmt::Display for Period {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Period::Year(year) => write!(f, "{}", year),
      Period::Label(label) => f.write_str(label),
    }
  }
}

impl From<i32> for Period {
  fn from(year: i32) -> Self {
    Period::Year(year)
  }
}

/// One indicator value with its reference period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
  pub value: f64,
  pub period: Period,
}

impl Reading {
  pub fn new(value: f64, period: impl Into<Period>) -> Self {
    Self {
      value,
      period: period.into(),
    }
  }
}

/// Where the data handed to the dashboard came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataOrigin {
  /// Pre-generated snapshot file
  Snapshot,
  /// Live upstream API call
  Live,
  /// Most recent point of the configured historical series
  Fallback,
  /// Nothing available at all
  Unavailable,
}

/// Result of the fetch pipeline for one indicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorData {
  pub indicator: String,
  pub reading: Option<Reading>,
  pub origin: DataOrigin,
  /// Why live data could not be used, when it couldn't
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  /// `ultimaAtualizacao` of the snapshot, for snapshot data
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub updated_at: Option<DateTime<Utc>>,
  /// Set when this result was served from the cache
  #[serde(skip)]
  pub from_cache: bool,
}

impl IndicatorData {
  pub fn live(indicator: &str, reading: Reading) -> Self {
    Self {
      indicator: indicator.to_string(),
      reading: Some(reading),
      origin: DataOrigin::Live,
      error: None,
      updated_at: None,
      from_cache: false,
    }
  }

  pub fn snapshot(indicator: &str, reading: Reading, updated_at: DateTime<Utc>) -> Self {
    Self {
      indicator: indicator.to_string(),
      reading: Some(reading),
      origin: DataOrigin::Snapshot,
      error: None,
      updated_at: Some(updated_at),
      from_cache: false,
    }
  }

  pub fn fallback(indicator: &str, reading: Reading, error: impl Into<String>) -> Self {
    Self {
      indicator: indicator.to_string(),
      reading: Some(reading),
      origin: DataOrigin::Fallback,
      error: Some(error.into()),
      updated_at: None,
      from_cache: false,
    }
  }

  pub fn unavailable(indicator: &str, error: impl Into<String>) -> Self {
    Self {
      indicator: indicator.to_string(),
      reading: None,
      origin: DataOrigin::Unavailable,
      error: Some(error.into()),
      updated_at: None,
      from_cache: false,
    }
  }

  /// True when the value shown is not fresh upstream data and the UI
  /// should offer a retry.
  pub fn used_fallback(&self) -> bool {
    matches!(self.origin, DataOrigin::Fallback | DataOrigin::Unavailable)
  }
}
