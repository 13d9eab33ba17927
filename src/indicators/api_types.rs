//! Serde-deserializable types matching upstream API responses and snapshot files.
//!
//! Each upstream has its own decoder. All of them produce the same canonical
//! [`Reading`] so retry and cache logic never see upstream-specific shapes.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

use super::types::{Period, Reading};
use crate::error::FetchError;

// ============================================================================
// Upstream formats
// ============================================================================

/// Known live response formats, tried in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upstream {
  /// IBGE SIDRA: `[ {header}, { "V": "8.1", "D2N": "2022", ... }, ... ]`
  Sidra,
  /// IBGE servicodados aggregates:
  /// `[ { "resultados": [ { "series": [ { "serie": { "2022": "8.1" } } ] } ] } ]`
  ServicoDados,
}

impl Upstream {
  pub const ALL: [Upstream; 2] = [Upstream::Sidra, Upstream::ServicoDados];

  /// Try to decode `body` as this format.
  pub fn decode(self, body: &Value) -> Option<Reading> {
    match self {
      Upstream::Sidra => decode_sidra(body),
      Upstream::ServicoDados => decode_servicodados(body),
    }
  }
}

/// Decode a raw response body into a reading.
///
/// Unparseable JSON and unknown shapes are both reported as
/// [`FetchError::Malformed`], which the retry engine treats like any other
/// failed attempt.
pub fn decode_reading(body: &[u8]) -> Result<Reading, FetchError> {
  let value: Value =
    serde_json::from_slice(body).map_err(|e| FetchError::Malformed(format!("invalid JSON: {}", e)))?;

  Upstream::ALL
    .iter()
    .find_map(|upstream| upstream.decode(&value))
    .ok_or_else(|| FetchError::Malformed("unexpected response shape".to_string()))
}

// ============================================================================
// SIDRA
// ============================================================================

/// The row after the header carries the value in `V` (or `valor` on some
/// mirrors) and the period label in `D2N`.
fn decode_sidra(body: &Value) -> Option<Reading> {
  let rows = body.as_array()?;
  if rows.len() < 2 {
    return None;
  }
  let row = rows[1].as_object()?;

  let value = row
    .get("V")
    .and_then(parse_number)
    .or_else(|| row.get("valor").and_then(parse_number))?;

  let period = row
    .get("D2N")
    .or_else(|| row.get("ano"))
    .and_then(parse_period)?;

  Some(Reading { value, period })
}

// ============================================================================
// servicodados
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiAggregate {
  #[serde(default)]
  pub resultados: Vec<ApiResult>,
}

#[derive(Debug, Deserialize)]
pub struct ApiResult {
  #[serde(default)]
  pub series: Vec<ApiSeries>,
}

#[derive(Debug, Deserialize)]
pub struct ApiSeries {
  #[serde(default)]
  pub serie: BTreeMap<String, Value>,
}

/// Take the latest period of the first series.
fn decode_servicodados(body: &Value) -> Option<Reading> {
  let aggregates: Vec<ApiAggregate> = serde_json::from_value(body.clone()).ok()?;

  let serie = &aggregates
    .first()?
    .resultados
    .first()?
    .series
    .first()?
    .serie;

  // BTreeMap iterates in key order; period keys sort chronologically
  let (period, raw) = serie.iter().next_back()?;
  let value = parse_number(raw)?;

  Some(Reading {
    value,
    period: Period::parse(period),
  })
}

// ============================================================================
// Snapshot files
// ============================================================================

/// Pre-generated static data file:
/// `{ "ultimaAtualizacao": "<ISO-8601>", "dados": { "valor": 8.1, "ano": 2024, ... } }`
#[derive(Debug, Deserialize)]
pub struct ApiSnapshotFile {
  #[serde(rename = "ultimaAtualizacao")]
  pub updated_at: String,
  pub dados: ApiSnapshotData,
}

/// Other fields (`fonte`, `unidade`, ...) are ignored.
#[derive(Debug, Deserialize)]
pub struct ApiSnapshotData {
  /// A JSON number or a numeric string
  pub valor: Value,
  pub ano: Option<Value>,
}

// ============================================================================
// Helpers
// ============================================================================

/// Numbers arrive either as JSON numbers or as numeric strings.
/// Non-finite results (SIDRA uses "..." and "-" for missing data) are rejected.
pub(crate) fn parse_number(value: &Value) -> Option<f64> {
  let number = match value {
    Value::Number(n) => n.as_f64()?,
    Value::String(s) => s.trim().parse::<f64>().ok()?,
    _ => return None,
  };

  number.is_finite().then_some(number)
}

pub(crate) fn parse_period(value: &Value) -> Option<Period> {
  match value {
    Value::String(s) if !s.trim().is_empty() => Some(Period::parse(s)),
    Value::Number(n) => n
      .as_i64()
      .and_then(|year| i32::try_from(year).ok())
      .map(Period::Year),
    _ => None,
  }
}
