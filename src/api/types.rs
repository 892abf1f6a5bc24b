//! Domain types for the catalog entities kept in the local store.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a catalog entity. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u32")]
pub struct EntityId(u32);

impl EntityId {
  /// Returns `None` for zero, negative or out of range values.
  pub fn new(raw: i64) -> Option<Self> {
    u32::try_from(raw).ok().filter(|id| *id > 0).map(Self)
  }

  /// Reads an id from a JSON value. Non-numeric and non-positive values yield `None`.
  pub fn from_json(value: &serde_json::Value) -> Option<Self> {
    if let Some(raw) = value.as_i64() {
      return Self::new(raw);
    }
    value
      .as_f64()
      .filter(|f| f.fract() == 0.0 && *f >= 1.0 && *f <= f64::from(u32::MAX))
      .and_then(|f| Self::new(f as i64))
  }

  pub fn get(self) -> u32 {
    self.0
  }
}

impl TryFrom<i64> for EntityId {
  type Error = String;

  fn try_from(raw: i64) -> Result<Self, Self::Error> {
    Self::new(raw).ok_or_else(|| format!("invalid entity id {}", raw))
  }
}

impl From<EntityId> for u32 {
  fn from(id: EntityId) -> Self {
    id.0
  }
}

impl fmt::Display for EntityId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Catalog entity kinds known to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
  Bank,
  Town,
  CashPoint,
}

impl EntityKind {
  /// Singular name used in logs and storage keys.
  pub fn name(self) -> &'static str {
    match self {
      Self::Bank => "bank",
      Self::Town => "town",
      Self::CashPoint => "cashpoint",
    }
  }

  /// Collection name used by the server in id lists and batch requests.
  pub fn collection(self) -> &'static str {
    match self {
      Self::Bank => "banks",
      Self::Town => "towns",
      Self::CashPoint => "cashpoints",
    }
  }
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Bank details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bank {
  pub id: EntityId,
  pub name: String,
  pub name_tr: String,
  pub name_tr_alt: String,
  pub town: String,
  pub tel: String,
  pub licence: u32,
  pub rating: u32,
  /// Client-local flag, never authoritative on the server side
  #[serde(default)]
  pub mine: bool,
}

/// Town details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Town {
  pub id: EntityId,
  pub name: String,
  pub name_tr: String,
  pub region_id: u32,
  pub regional_center: bool,
  pub longitude: f64,
  pub latitude: f64,
  pub zoom: f64,
  #[serde(default)]
  pub mine: bool,
}

/// Cash point (ATM or office) details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashPoint {
  pub id: EntityId,
  #[serde(rename = "type")]
  pub point_type: String,
  pub bank_id: u32,
  pub town_id: u32,
  pub longitude: f64,
  pub latitude: f64,
  pub address: String,
  pub address_comment: String,
  pub metro_name: String,
  pub main_office: bool,
  pub without_weekend: bool,
  pub round_the_clock: bool,
  pub works_as_shop: bool,
  pub free_access: bool,
  pub currency: Vec<u32>,
  pub cash_in: bool,
  pub schedule: String,
  /// Server-side modification time, unix seconds
  pub timestamp: i64,
  pub approved: bool,
  pub patch_count: u32,
}

/// Group of cash points shown as a single marker on the map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
  pub longitude: f64,
  pub latitude: f64,
  pub size: u32,
}
