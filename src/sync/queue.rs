//! Pending id queue and retry budget used by the sync pipeline.

use std::collections::{HashSet, VecDeque};

use crate::api::types::EntityId;

/// Ordered ids awaiting a detail fetch.
///
/// Consumed from the front in fixed-size batches. A batch that failed goes
/// back to the front in its original order, ahead of newer ids.
#[derive(Debug, Default, Clone)]
pub struct PendingIdQueue {
  ids: VecDeque<EntityId>,
}

impl PendingIdQueue {
  pub fn new() -> Self {
    Self::default()
  }

  /// Replace the whole queue with a fresh id list.
  pub fn replace(&mut self, ids: impl IntoIterator<Item = EntityId>) {
    self.ids = ids.into_iter().collect();
  }

  /// Pop up to `size` ids from the front.
  pub fn pop_batch(&mut self, size: usize) -> Vec<EntityId> {
    let take = size.min(self.ids.len());
    self.ids.drain(..take).collect()
  }

  /// Return a batch to the front, keeping its order.
  pub fn push_front(&mut self, batch: Vec<EntityId>) {
    for id in batch.into_iter().rev() {
      self.ids.push_front(id);
    }
  }

  pub fn push_back(&mut self, ids: impl IntoIterator<Item = EntityId>) {
    self.ids.extend(ids);
  }

  /// Drop every id listed in `consumed`.
  pub fn remove_all(&mut self, consumed: &HashSet<EntityId>) {
    self.ids.retain(|id| !consumed.contains(id));
  }

  pub fn contains(&self, id: EntityId) -> bool {
    self.ids.contains(&id)
  }

  pub fn iter(&self) -> impl Iterator<Item = EntityId> + '_ {
    self.ids.iter().copied()
  }

  pub fn len(&self) -> usize {
    self.ids.len()
  }

  pub fn is_empty(&self) -> bool {
    self.ids.is_empty()
  }
}

/// Remaining attempts for one logical operation.
///
/// Carried by value through every continuation. It only ever decreases; the
/// owner gets a fresh one after a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
  left: u32,
}

impl RetryBudget {
  pub fn new(attempts: u32) -> Self {
    Self { left: attempts }
  }

  pub fn left(self) -> u32 {
    self.left
  }

  /// Spend one attempt. Returns the budget for the next try, or `None` when
  /// nothing is left.
  pub fn consume(self) -> Option<Self> {
    let left = self.left.saturating_sub(1);
    (left > 0).then_some(Self { left })
  }
}
