//! Core traits for entities kept in the local store.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::api::api_types::{ApiBank, ApiCashPoint, ApiTown};
use crate::api::types::{Bank, CashPoint, EntityId, EntityKind, Town};

/// Trait for entities that can be stored locally.
///
/// Implementors provide their id and kind, a conversion from the server
/// representation, and access to the client-local `mine` flag.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Entity kind, used as the storage namespace
  const KIND: EntityKind;

  fn id(&self) -> EntityId;

  /// Client-local ownership flag. Kinds without one always return false.
  fn is_mine(&self) -> bool {
    false
  }

  fn set_mine(&mut self, _mine: bool) {}

  /// Build an entity from one element of a server response. Returns `None`
  /// for objects of the wrong shape or without a valid id.
  fn from_wire(value: &Value) -> Option<Self>;

  /// Merge a server copy with the locally stored one.
  ///
  /// The server never clears `mine`; a locally set flag survives overwrites.
  fn merged_with(mut self, local: Option<&Self>) -> Self {
    if local.is_some_and(Cacheable::is_mine) {
      self.set_mine(true);
    }
    self
  }
}

impl Cacheable for Bank {
  const KIND: EntityKind = EntityKind::Bank;

  fn id(&self) -> EntityId {
    self.id
  }

  fn is_mine(&self) -> bool {
    self.mine
  }

  fn set_mine(&mut self, mine: bool) {
    self.mine = mine;
  }

  fn from_wire(value: &Value) -> Option<Self> {
    ApiBank::deserialize(value).ok()?.into_domain()
  }
}

impl Cacheable for Town {
  const KIND: EntityKind = EntityKind::Town;

  fn id(&self) -> EntityId {
    self.id
  }

  fn is_mine(&self) -> bool {
    self.mine
  }

  fn set_mine(&mut self, mine: bool) {
    self.mine = mine;
  }

  fn from_wire(value: &Value) -> Option<Self> {
    ApiTown::deserialize(value).ok()?.into_domain()
  }
}

impl Cacheable for CashPoint {
  const KIND: EntityKind = EntityKind::CashPoint;

  fn id(&self) -> EntityId {
    self.id
  }

  fn from_wire(value: &Value) -> Option<Self> {
    ApiCashPoint::deserialize(value).ok()?.into_domain()
  }
}
