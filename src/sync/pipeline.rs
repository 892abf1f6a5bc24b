//! Two-phase pull of one entity kind: id list first, then records in batches.

use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Map, Value};
use std::collections::{HashSet, VecDeque};
use std::marker::PhantomData;
use tracing::{debug, error, info, warn};

use super::queue::{PendingIdQueue, RetryBudget};
use crate::api::api_types::{parse_icon, parse_id_list, parse_object_array};
use crate::api::transport::{Outcome, RequestId, Transport, ATTEMPTS_EXHAUSTED};
use crate::api::types::{Bank, EntityId, EntityKind, Town};
use crate::cache::{Cacheable, EntityStore, IconStore, OfflineSnapshot};
use crate::notify::ProgressSink;

/// Server endpoints of a synchronized kind.
pub trait Catalog: Cacheable {
  /// Full id list, `GET`
  const IDS_PATH: &'static str;
  /// Records for a list of ids, `POST`
  const BATCH_PATH: &'static str;

  /// Side payload fetched for every synced record, if the kind has one.
  fn icon_path(_id: EntityId) -> Option<String> {
    None
  }
}

impl Catalog for Bank {
  const IDS_PATH: &'static str = "/banks";
  const BATCH_PATH: &'static str = "/banks";

  fn icon_path(id: EntityId) -> Option<String> {
    Some(format!("/bank/{}/ico", id))
  }
}

impl Catalog for Town {
  const IDS_PATH: &'static str = "/towns";
  const BATCH_PATH: &'static str = "/towns";
}

/// Tunables shared by every pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
  pub attempts: u32,
  pub batch_size: usize,
  pub icon_parallelism: usize,
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      attempts: 3,
      batch_size: 128,
      icon_parallelism: 4,
    }
  }
}

/// Continuation stored with every pipeline request.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncContinuation {
  pub kind: EntityKind,
  pub step: SyncStep,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncStep {
  Ids { budget: RetryBudget },
  Batch { ids: Vec<EntityId>, budget: RetryBudget },
  Icon { id: EntityId, budget: RetryBudget },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelinePhase {
  #[default]
  Idle,
  FetchingIds,
  FetchingData,
  Completed,
  Failed,
}

impl PipelinePhase {
  pub fn is_running(self) -> bool {
    matches!(self, Self::FetchingIds | Self::FetchingData)
  }
}

/// Collaborators a pipeline works with while handling one event.
pub struct SyncContext<'a, R, S> {
  pub transport: &'a mut Transport<R>,
  pub store: &'a S,
  pub icons: &'a dyn IconStore,
  pub sink: &'a dyn ProgressSink,
}

pub struct SyncPipeline<E> {
  settings: SyncSettings,
  snapshot: Option<OfflineSnapshot<E>>,
  phase: PipelinePhase,
  pending: PendingIdQueue,
  total: usize,
  uploaded: usize,
  /// Ids already put back once after the server left them out of a batch
  requeued: HashSet<EntityId>,
  icon_queue: VecDeque<EntityId>,
  icons_in_flight: usize,
  _entity: PhantomData<fn() -> E>,
}

impl<E: Catalog> SyncPipeline<E> {
  pub fn new(settings: SyncSettings, snapshot: Option<OfflineSnapshot<E>>) -> Result<Self> {
    if settings.batch_size == 0 {
      return Err(eyre!("{} sync batch size must be positive", E::KIND));
    }
    if settings.attempts == 0 {
      return Err(eyre!("{} sync attempts must be positive", E::KIND));
    }

    Ok(Self {
      settings,
      snapshot,
      phase: PipelinePhase::Idle,
      pending: PendingIdQueue::new(),
      total: 0,
      uploaded: 0,
      requeued: HashSet::new(),
      icon_queue: VecDeque::new(),
      icons_in_flight: 0,
      _entity: PhantomData,
    })
  }

  pub fn phase(&self) -> PipelinePhase {
    self.phase
  }

  /// `(done, total)` of the current or last run.
  pub fn progress(&self) -> (usize, usize) {
    (self.uploaded, self.total)
  }

  pub fn pending(&self) -> &PendingIdQueue {
    &self.pending
  }

  pub fn is_busy(&self) -> bool {
    self.phase.is_running() || self.icons_in_flight > 0 || !self.icon_queue.is_empty()
  }

  fn budget(&self) -> RetryBudget {
    RetryBudget::new(self.settings.attempts)
  }

  fn continuation(step: SyncStep) -> SyncContinuation {
    SyncContinuation {
      kind: E::KIND,
      step,
    }
  }

  /// Start a full sync. Returns false when one is already running.
  pub fn refresh<R, S>(&mut self, ctx: &mut SyncContext<'_, R, S>) -> bool
  where
    R: From<SyncContinuation>,
    S: EntityStore<E>,
  {
    if self.phase.is_running() {
      debug!(kind = %E::KIND, "sync already running, refresh ignored");
      return false;
    }

    info!(kind = %E::KIND, "starting sync");
    self.phase = PipelinePhase::FetchingIds;
    self.requeued.clear();
    self.send_ids(self.budget(), ctx);
    true
  }

  /// Resolve one of this pipeline's requests.
  pub fn handle<R, S>(
    &mut self,
    request_id: RequestId,
    step: SyncStep,
    outcome: Outcome,
    ctx: &mut SyncContext<'_, R, S>,
  ) where
    R: From<SyncContinuation>,
    S: EntityStore<E>,
  {
    match step {
      SyncStep::Ids { budget } => {
        if self.phase != PipelinePhase::FetchingIds {
          warn!(kind = %E::KIND, %request_id, "id list result outside of id phase");
          return;
        }
        self.on_ids(request_id, budget, outcome, ctx);
      }
      SyncStep::Batch { ids, budget } => {
        if self.phase != PipelinePhase::FetchingData {
          warn!(kind = %E::KIND, %request_id, "batch result outside of data phase");
          return;
        }
        self.on_batch(request_id, ids, budget, outcome, ctx);
      }
      SyncStep::Icon { id, budget } => self.on_icon(id, budget, outcome, ctx),
    }
  }

  // ============================================================================
  // Phase A
  // ============================================================================

  fn send_ids<R, S>(&mut self, budget: RetryBudget, ctx: &mut SyncContext<'_, R, S>)
  where
    R: From<SyncContinuation>,
  {
    ctx
      .transport
      .send(E::IDS_PATH, None, Self::continuation(SyncStep::Ids { budget }));
  }

  fn on_ids<R, S>(
    &mut self,
    request_id: RequestId,
    budget: RetryBudget,
    outcome: Outcome,
    ctx: &mut SyncContext<'_, R, S>,
  ) where
    R: From<SyncContinuation>,
    S: EntityStore<E>,
  {
    let body = match outcome {
      Outcome::Timeout => {
        match budget.consume() {
          Some(next) => {
            warn!(kind = %E::KIND, left = next.left(), "id list request timed out, retrying");
            self.send_ids(next, ctx);
          }
          None => self.fail(request_id, ATTEMPTS_EXHAUSTED, ctx),
        }
        return;
      }
      Outcome::TransportError(kind) => {
        self.fail(request_id, kind.message(), ctx);
        return;
      }
      Outcome::Ok { status, .. } if !(200..300).contains(&status) => {
        self.fail(request_id, &format!("Server http response: {}", status), ctx);
        return;
      }
      Outcome::Ok { body, .. } => body,
    };

    let ids = match parse_id_list(&body, E::KIND.collection()) {
      Ok(ids) => ids,
      Err(e) => {
        self.fail(request_id, &e.to_string(), ctx);
        return;
      }
    };

    self.pending.replace(ids);
    self.total = self.pending.len();
    self.uploaded = 0;
    self.phase = PipelinePhase::FetchingData;
    info!(kind = %E::KIND, total = self.total, "received id list");

    if let Some(snapshot) = &self.snapshot {
      let restored = snapshot.restore(&mut self.pending, ctx.store);
      self.uploaded += restored.len();
      self.queue_icons(&restored, ctx);
    }

    ctx.sink.on_progress(E::KIND, self.uploaded, self.total);
    self.send_next_batch(self.budget(), ctx);
  }

  // ============================================================================
  // Phase B
  // ============================================================================

  fn send_next_batch<R, S>(&mut self, budget: RetryBudget, ctx: &mut SyncContext<'_, R, S>)
  where
    R: From<SyncContinuation>,
    S: EntityStore<E>,
  {
    let ids = self.pending.pop_batch(self.settings.batch_size);
    if ids.is_empty() {
      self.complete(ctx);
      return;
    }

    let mut body = Map::new();
    body.insert(E::KIND.collection().to_string(), json!(ids));
    debug!(kind = %E::KIND, count = ids.len(), left = budget.left(), "requesting batch");
    ctx.transport.send(
      E::BATCH_PATH,
      Some(Value::Object(body)),
      Self::continuation(SyncStep::Batch { ids, budget }),
    );
  }

  fn on_batch<R, S>(
    &mut self,
    request_id: RequestId,
    ids: Vec<EntityId>,
    budget: RetryBudget,
    outcome: Outcome,
    ctx: &mut SyncContext<'_, R, S>,
  ) where
    R: From<SyncContinuation>,
    S: EntityStore<E>,
  {
    let failure = match &outcome {
      Outcome::Timeout => Some(ATTEMPTS_EXHAUSTED.to_string()),
      Outcome::TransportError(kind) => Some(kind.message().to_string()),
      Outcome::Ok { status, .. } if !(200..300).contains(status) => {
        Some(format!("Server http response: {}", status))
      }
      Outcome::Ok { .. } => None,
    };

    if let Some(message) = failure {
      self.pending.push_front(ids);
      match budget.consume() {
        Some(next) => {
          warn!(kind = %E::KIND, left = next.left(), "batch request failed, retrying: {:?}", outcome);
          self.send_next_batch(next, ctx);
        }
        None => self.fail(request_id, &message, ctx),
      }
      return;
    }

    let Outcome::Ok { body, .. } = outcome else {
      return;
    };

    let items = match parse_object_array(&body) {
      Ok(items) => items,
      Err(e) => {
        self.pending.push_front(ids);
        self.fail(request_id, &e.to_string(), ctx);
        return;
      }
    };

    let requested: HashSet<EntityId> = ids.iter().copied().collect();
    let mut received = HashSet::new();
    let mut failed = HashSet::new();

    for item in &items {
      let Some(entity) = E::from_wire(item) else {
        warn!(kind = %E::KIND, "dropping record without valid id: {}", short(item));
        continue;
      };
      let id = entity.id();
      if !requested.contains(&id) {
        debug!(kind = %E::KIND, %id, "record was not requested");
      }

      match self.store_entity(entity, ctx.store) {
        Ok(()) => {
          received.insert(id);
        }
        Err(e) => {
          warn!(kind = %E::KIND, %id, "failed to store record: {}", e);
          failed.insert(id);
        }
      }
    }

    let stored: Vec<EntityId> = ids.iter().copied().filter(|id| received.contains(id)).collect();
    self.uploaded += stored.len();
    self.requeue_missing(&ids, &received, &failed);
    self.queue_icons(&stored, ctx);

    ctx.sink.on_progress(E::KIND, self.uploaded, self.total);
    self.send_next_batch(self.budget(), ctx);
  }

  fn store_entity<S: EntityStore<E>>(&self, entity: E, store: &S) -> Result<()> {
    let local = store.query_by_id(entity.id())?;
    store.upsert(&entity.merged_with(local.as_ref()))
  }

  /// Ids the server left out of a response get one more chance at the end
  /// of the queue.
  fn requeue_missing(
    &mut self,
    ids: &[EntityId],
    received: &HashSet<EntityId>,
    failed: &HashSet<EntityId>,
  ) {
    let missing: Vec<EntityId> = ids
      .iter()
      .copied()
      .filter(|id| !received.contains(id) && !failed.contains(id))
      .collect();

    for id in missing {
      if self.requeued.insert(id) {
        debug!(kind = %E::KIND, %id, "record missing from response, requeued");
        self.pending.push_back([id]);
      } else {
        warn!(kind = %E::KIND, %id, "record missing from response again, dropped");
      }
    }
  }

  fn complete<R, S>(&mut self, ctx: &mut SyncContext<'_, R, S>)
  where
    R: From<SyncContinuation>,
    S: EntityStore<E>,
  {
    self.phase = PipelinePhase::Completed;
    info!(kind = %E::KIND, done = self.uploaded, total = self.total, "sync complete");

    if let Some(snapshot) = &self.snapshot {
      match ctx.store.query_all() {
        Ok(entities) => {
          if let Err(e) = snapshot.save(&entities) {
            warn!(kind = %E::KIND, "failed to save offline snapshot: {}", e);
          }
        }
        Err(e) => warn!(kind = %E::KIND, "failed to read entities for snapshot: {}", e),
      }
    }

    ctx.sink.on_complete(E::KIND);
  }

  fn fail<R, S>(&mut self, request_id: RequestId, message: &str, ctx: &mut SyncContext<'_, R, S>) {
    self.phase = PipelinePhase::Failed;
    error!(kind = %E::KIND, %request_id, "sync failed: {}", message);
    ctx.sink.on_error(E::KIND, Some(request_id), message);
  }

  // ============================================================================
  // Icons
  // ============================================================================

  fn queue_icons<R, S>(&mut self, ids: &[EntityId], ctx: &mut SyncContext<'_, R, S>)
  where
    R: From<SyncContinuation>,
  {
    self
      .icon_queue
      .extend(ids.iter().copied().filter(|id| E::icon_path(*id).is_some()));
    self.pump_icons(ctx);
  }

  /// Dispatch queued icon fetches up to the parallelism limit.
  fn pump_icons<R, S>(&mut self, ctx: &mut SyncContext<'_, R, S>)
  where
    R: From<SyncContinuation>,
  {
    while self.icons_in_flight < self.settings.icon_parallelism {
      let Some(id) = self.icon_queue.pop_front() else {
        break;
      };
      if ctx.icons.contains(E::KIND, id) {
        continue;
      }
      self.send_icon(id, self.budget(), ctx);
    }
  }

  fn send_icon<R, S>(&mut self, id: EntityId, budget: RetryBudget, ctx: &mut SyncContext<'_, R, S>)
  where
    R: From<SyncContinuation>,
  {
    let Some(path) = E::icon_path(id) else {
      return;
    };
    self.icons_in_flight += 1;
    ctx
      .transport
      .send(path, None, Self::continuation(SyncStep::Icon { id, budget }));
  }

  fn on_icon<R, S>(
    &mut self,
    id: EntityId,
    budget: RetryBudget,
    outcome: Outcome,
    ctx: &mut SyncContext<'_, R, S>,
  ) where
    R: From<SyncContinuation>,
  {
    self.icons_in_flight = self.icons_in_flight.saturating_sub(1);

    let error = match outcome {
      Outcome::Timeout => match budget.consume() {
        Some(next) => {
          debug!(kind = %E::KIND, %id, left = next.left(), "icon request timed out, retrying");
          self.send_icon(id, next, ctx);
          None
        }
        None => Some(ATTEMPTS_EXHAUSTED.to_string()),
      },
      Outcome::TransportError(kind) => Some(kind.message().to_string()),
      Outcome::Ok { status: 404, .. } => {
        debug!(kind = %E::KIND, %id, "no icon on server");
        None
      }
      Outcome::Ok { status, .. } if !(200..300).contains(&status) => {
        Some(format!("Server http response: {}", status))
      }
      Outcome::Ok { body, .. } => match parse_icon(&body) {
        Ok(data) if ctx.icons.load(E::KIND, id, &data) => None,
        Ok(_) => Some(format!("icon for {} {} could not be loaded", E::KIND, id)),
        Err(e) => Some(e.to_string()),
      },
    };

    if let Some(message) = error {
      warn!(kind = %E::KIND, %id, "icon fetch failed: {}", message);
      ctx.sink.on_icon_error(E::KIND, id, &message);
    }

    self.pump_icons(ctx);
  }
}

fn short(value: &Value) -> String {
  let text = value.to_string();
  match text.char_indices().nth(80) {
    Some((idx, _)) => format!("{}...", &text[..idx]),
    None => text,
  }
}
