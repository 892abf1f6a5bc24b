//! Serde-deserializable types matching catalog server responses.
//!
//! These types are separate from domain types so that missing or null fields
//! in server payloads degrade to defaults instead of rejecting the record,
//! while domain types stay strict about what the client stores.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashSet;

use super::types::{Bank, CashPoint, Cluster, EntityId, Town};

/// Parse a response body as JSON.
pub fn parse_json(body: &[u8]) -> Result<Value> {
  serde_json::from_slice(body).map_err(|e| eyre!("server response json parse error: {}", e))
}

/// Keep positive ids in server order, dropping duplicates and junk entries.
fn collect_ids<'a>(values: impl IntoIterator<Item = &'a Value>) -> Vec<EntityId> {
  let mut seen = HashSet::new();
  values
    .into_iter()
    .filter_map(EntityId::from_json)
    .filter(|id| seen.insert(*id))
    .collect()
}

// ============================================================================
// Id lists
// ============================================================================

/// Parse an id list response of the form `{"<field>": [1, 2, ...]}`.
///
/// Non-positive and non-numeric entries are filtered out; a missing field or
/// a non-object document is a protocol error.
pub fn parse_id_list(body: &[u8], field: &str) -> Result<Vec<EntityId>> {
  let json = parse_json(body)?;
  let obj = json
    .as_object()
    .ok_or_else(|| eyre!("id list response is not an object"))?;
  let ids = obj
    .get(field)
    .and_then(Value::as_array)
    .ok_or_else(|| eyre!("json field \"{}\" is not an array", field))?;
  Ok(collect_ids(ids))
}

/// Parse a bare JSON array of ids.
pub fn parse_id_array(body: &[u8]) -> Result<Vec<EntityId>> {
  let json = parse_json(body)?;
  let ids = json
    .as_array()
    .ok_or_else(|| eyre!("response is not an array"))?;
  Ok(collect_ids(ids))
}

/// Parse a JSON array of objects. Returns the elements, the caller decides
/// what to do with each of them.
pub fn parse_object_array(body: &[u8]) -> Result<Vec<Value>> {
  match parse_json(body)? {
    Value::Array(values) => Ok(values),
    other => Err(eyre!(
      "json array expected, got: {}",
      truncate(&other.to_string(), 120)
    )),
  }
}

fn truncate(s: &str, max: usize) -> &str {
  match s.char_indices().nth(max) {
    Some((idx, _)) => &s[..idx],
    None => s,
  }
}

// ============================================================================
// Entities
// ============================================================================

// Only the id decides whether a record is usable. Every other field falls
// back to its default when the server sends an unexpected type.

fn lenient<'de, D, T>(deserializer: D, convert: fn(&Value) -> Option<T>) -> Result<Option<T>, D::Error>
where
  D: Deserializer<'de>,
{
  let value = Value::deserialize(deserializer)?;
  Ok(convert(&value))
}

fn as_string(value: &Value) -> Option<String> {
  value.as_str().map(str::to_string)
}

fn as_u32(value: &Value) -> Option<u32> {
  match value {
    Value::Number(n) => n
      .as_u64()
      .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
      .and_then(|n| u32::try_from(n).ok()),
    Value::String(s) => s.trim().parse().ok(),
    _ => None,
  }
}

fn as_i64(value: &Value) -> Option<i64> {
  match value {
    Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
    Value::String(s) => s.trim().parse().ok(),
    _ => None,
  }
}

fn as_f64(value: &Value) -> Option<f64> {
  match value {
    Value::Number(n) => n.as_f64(),
    Value::String(s) => s.trim().parse().ok(),
    _ => None,
  }
}

fn as_bool(value: &Value) -> Option<bool> {
  match value {
    Value::Bool(b) => Some(*b),
    Value::Number(n) => n.as_f64().map(|f| f != 0.0),
    _ => None,
  }
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
  lenient(d, as_string)
}

fn lenient_u32<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
  lenient(d, as_u32)
}

fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
  lenient(d, as_i64)
}

fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
  lenient(d, as_f64)
}

fn lenient_bool<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
  lenient(d, as_bool)
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ApiBank {
  pub id: Option<Value>,
  #[serde(deserialize_with = "lenient_string")]
  pub name: Option<String>,
  #[serde(deserialize_with = "lenient_string")]
  pub name_tr: Option<String>,
  #[serde(deserialize_with = "lenient_string")]
  pub name_tr_alt: Option<String>,
  #[serde(deserialize_with = "lenient_string")]
  pub town: Option<String>,
  #[serde(deserialize_with = "lenient_string")]
  pub tel: Option<String>,
  #[serde(deserialize_with = "lenient_u32")]
  pub licence: Option<u32>,
  #[serde(deserialize_with = "lenient_u32")]
  pub rating: Option<u32>,
  #[serde(deserialize_with = "lenient_bool")]
  pub mine: Option<bool>,
}

impl ApiBank {
  pub fn into_domain(self) -> Option<Bank> {
    Some(Bank {
      id: self.id.as_ref().and_then(EntityId::from_json)?,
      name: self.name.unwrap_or_default(),
      name_tr: self.name_tr.unwrap_or_default(),
      name_tr_alt: self.name_tr_alt.unwrap_or_default(),
      town: self.town.unwrap_or_default(),
      tel: self.tel.unwrap_or_default(),
      licence: self.licence.unwrap_or_default(),
      rating: self.rating.unwrap_or_default(),
      mine: self.mine.unwrap_or_default(),
    })
  }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ApiTown {
  pub id: Option<Value>,
  #[serde(deserialize_with = "lenient_string")]
  pub name: Option<String>,
  #[serde(deserialize_with = "lenient_string")]
  pub name_tr: Option<String>,
  #[serde(deserialize_with = "lenient_u32")]
  pub region_id: Option<u32>,
  #[serde(deserialize_with = "lenient_bool")]
  pub regional_center: Option<bool>,
  #[serde(deserialize_with = "lenient_f64")]
  pub longitude: Option<f64>,
  #[serde(deserialize_with = "lenient_f64")]
  pub latitude: Option<f64>,
  #[serde(deserialize_with = "lenient_f64")]
  pub zoom: Option<f64>,
  #[serde(deserialize_with = "lenient_bool")]
  pub mine: Option<bool>,
}

impl ApiTown {
  pub fn into_domain(self) -> Option<Town> {
    Some(Town {
      id: self.id.as_ref().and_then(EntityId::from_json)?,
      name: self.name.unwrap_or_default(),
      name_tr: self.name_tr.unwrap_or_default(),
      region_id: self.region_id.unwrap_or_default(),
      regional_center: self.regional_center.unwrap_or_default(),
      longitude: self.longitude.unwrap_or_default(),
      latitude: self.latitude.unwrap_or_default(),
      zoom: self.zoom.unwrap_or_default(),
      mine: self.mine.unwrap_or_default(),
    })
  }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ApiCashPoint {
  pub id: Option<Value>,
  #[serde(rename = "type", deserialize_with = "lenient_string")]
  pub point_type: Option<String>,
  #[serde(deserialize_with = "lenient_u32")]
  pub bank_id: Option<u32>,
  #[serde(deserialize_with = "lenient_u32")]
  pub town_id: Option<u32>,
  #[serde(deserialize_with = "lenient_f64")]
  pub longitude: Option<f64>,
  #[serde(deserialize_with = "lenient_f64")]
  pub latitude: Option<f64>,
  #[serde(deserialize_with = "lenient_string")]
  pub address: Option<String>,
  #[serde(deserialize_with = "lenient_string")]
  pub address_comment: Option<String>,
  #[serde(deserialize_with = "lenient_string")]
  pub metro_name: Option<String>,
  #[serde(deserialize_with = "lenient_bool")]
  pub main_office: Option<bool>,
  #[serde(deserialize_with = "lenient_bool")]
  pub without_weekend: Option<bool>,
  #[serde(deserialize_with = "lenient_bool")]
  pub round_the_clock: Option<bool>,
  #[serde(deserialize_with = "lenient_bool")]
  pub works_as_shop: Option<bool>,
  #[serde(deserialize_with = "lenient_bool")]
  pub free_access: Option<bool>,
  pub currency: Option<Value>,
  #[serde(deserialize_with = "lenient_bool")]
  pub cash_in: Option<bool>,
  pub schedule: Option<Value>,
  #[serde(deserialize_with = "lenient_i64")]
  pub timestamp: Option<i64>,
  #[serde(deserialize_with = "lenient_bool")]
  pub approved: Option<bool>,
  #[serde(deserialize_with = "lenient_u32")]
  pub patch_count: Option<u32>,
}

impl ApiCashPoint {
  pub fn into_domain(self) -> Option<CashPoint> {
    let schedule = match self.schedule {
      Some(Value::String(s)) => s,
      Some(Value::Null) | None => String::new(),
      // Newer servers send the schedule as an object
      Some(other) => other.to_string(),
    };
    let currency = match self.currency {
      Some(Value::Array(codes)) => codes
        .iter()
        .filter_map(EntityId::from_json)
        .map(EntityId::get)
        .collect(),
      _ => Vec::new(),
    };

    Some(CashPoint {
      id: self.id.as_ref().and_then(EntityId::from_json)?,
      point_type: self.point_type.unwrap_or_default(),
      bank_id: self.bank_id.unwrap_or_default(),
      town_id: self.town_id.unwrap_or_default(),
      longitude: self.longitude.unwrap_or_default(),
      latitude: self.latitude.unwrap_or_default(),
      address: self.address.unwrap_or_default(),
      address_comment: self.address_comment.unwrap_or_default(),
      metro_name: self.metro_name.unwrap_or_default(),
      main_office: self.main_office.unwrap_or_default(),
      without_weekend: self.without_weekend.unwrap_or_default(),
      round_the_clock: self.round_the_clock.unwrap_or_default(),
      works_as_shop: self.works_as_shop.unwrap_or_default(),
      free_access: self.free_access.unwrap_or_default(),
      currency,
      cash_in: self.cash_in.unwrap_or_default(),
      schedule,
      timestamp: self.timestamp.unwrap_or_default(),
      approved: self.approved.unwrap_or_default(),
      patch_count: self.patch_count.unwrap_or_default(),
    })
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiCluster {
  #[serde(default)]
  pub longitude: f64,
  #[serde(default)]
  pub latitude: f64,
  pub size: u32,
}

impl From<ApiCluster> for Cluster {
  fn from(c: ApiCluster) -> Self {
    Self {
      longitude: c.longitude,
      latitude: c.latitude,
      size: c.size,
    }
  }
}

// ============================================================================
// Side payloads
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiIcon {
  pub bank_id: Option<u32>,
  pub ico_data: String,
}

/// Parse a bank icon response and return the raw image bytes.
pub fn parse_icon(body: &[u8]) -> Result<Vec<u8>> {
  let icon: ApiIcon =
    serde_json::from_slice(body).map_err(|e| eyre!("icon response parse error: {}", e))?;
  if icon.ico_data.is_empty() {
    return Err(eyre!("icon response for bank {:?} is empty", icon.bank_id));
  }
  Ok(icon.ico_data.into_bytes())
}

/// Health check response
#[derive(Debug, Deserialize)]
pub struct ApiMessage {
  pub text: String,
}
