//! Test doubles shared by the unit tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::api::transport::{Network, Outcome, WireRequest};
use crate::api::types::{EntityId, EntityKind};
use crate::cache::{Cacheable, CachedEntity, EntityStore, MemoryStorage};
use crate::notify::Notification;

/// Network that only records what was sent.
#[derive(Clone, Default)]
pub struct RecordingNetwork {
  sent: Arc<Mutex<Vec<WireRequest>>>,
}

impl RecordingNetwork {
  pub fn len(&self) -> usize {
    self.sent.lock().unwrap().len()
  }

  /// Drain everything sent so far.
  pub fn take(&self) -> Vec<WireRequest> {
    std::mem::take(&mut *self.sent.lock().unwrap())
  }

  /// Drain and return the single request sent since the last call.
  pub fn take_one(&self) -> WireRequest {
    let mut sent = self.take();
    assert_eq!(sent.len(), 1, "expected exactly one request, got {:?}", sent);
    sent.remove(0)
  }
}

impl Network for RecordingNetwork {
  fn dispatch(&self, request: WireRequest) {
    self.sent.lock().unwrap().push(request);
  }
}

/// Memory store that logs upserts and can be told to fail some of them.
#[derive(Default)]
pub struct RecordingStore {
  inner: MemoryStorage,
  upserts: Mutex<Vec<(EntityKind, EntityId)>>,
  failing: Mutex<HashSet<(EntityKind, EntityId)>>,
}

impl RecordingStore {
  pub fn fail_on(&self, kind: EntityKind, id: u32) {
    self.failing.lock().unwrap().insert((kind, eid(id)));
  }

  /// Ids upserted so far for `kind`, in order.
  pub fn upserted(&self, kind: EntityKind) -> Vec<u32> {
    self
      .upserts
      .lock()
      .unwrap()
      .iter()
      .filter(|(k, _)| *k == kind)
      .map(|(_, id)| id.get())
      .collect()
  }

  pub fn memory(&self) -> &MemoryStorage {
    &self.inner
  }
}

impl<E: Cacheable> EntityStore<E> for RecordingStore {
  fn upsert(&self, entity: &E) -> Result<()> {
    let key = (E::KIND, entity.id());
    if self.failing.lock().unwrap().contains(&key) {
      return Err(eyre!("disk full"));
    }
    self.upserts.lock().unwrap().push(key);
    self.inner.upsert(entity)
  }

  fn query_entry(&self, id: EntityId) -> Result<Option<CachedEntity<E>>> {
    self.inner.query_entry(id)
  }

  fn query_all(&self) -> Result<Vec<E>> {
    self.inner.query_all()
  }
}

pub fn eid(raw: u32) -> EntityId {
  EntityId::new(i64::from(raw)).unwrap()
}

pub fn ok_json(value: serde_json::Value) -> Outcome {
  Outcome::Ok {
    status: 200,
    body: serde_json::to_vec(&value).unwrap(),
  }
}

pub fn status(code: u16) -> Outcome {
  Outcome::Ok {
    status: code,
    body: Vec::new(),
  }
}

/// Everything queued on the notification channel so far.
pub fn drain(rx: &mut UnboundedReceiver<Notification>) -> Vec<Notification> {
  let mut out = Vec::new();
  while let Ok(notification) = rx.try_recv() {
    out.push(notification);
  }
  out
}
