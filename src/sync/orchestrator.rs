use color_eyre::Result;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use super::pipeline::{PipelinePhase, SyncContext, SyncContinuation, SyncPipeline, SyncSettings};
use crate::api::transport::{Outcome, RequestId};
use crate::api::types::{Bank, EntityKind, Town};
use crate::cache::{EntityStore, OfflineSnapshot};

/// One pipeline per synchronized kind behind a single refresh entry point.
///
/// Pipelines never wait on each other; results are routed by the kind stored
/// in the continuation.
pub struct SyncOrchestrator {
  banks: SyncPipeline<Bank>,
  towns: SyncPipeline<Town>,
}

impl SyncOrchestrator {
  /// Build the pipelines. Snapshots are kept in `snapshot_dir` when given.
  pub fn new(
    settings: SyncSettings,
    snapshot_dir: Option<&Path>,
    snapshot_max_age: Duration,
  ) -> Result<Self> {
    Ok(Self {
      banks: SyncPipeline::new(
        settings,
        snapshot_dir.map(|dir| OfflineSnapshot::new(dir, snapshot_max_age)),
      )?,
      towns: SyncPipeline::new(
        settings,
        snapshot_dir.map(|dir| OfflineSnapshot::new(dir, snapshot_max_age)),
      )?,
    })
  }

  /// Start syncing `kind`. Returns false if nothing was started.
  pub fn refresh<R, S>(&mut self, kind: EntityKind, ctx: &mut SyncContext<'_, R, S>) -> bool
  where
    R: From<SyncContinuation>,
    S: EntityStore<Bank> + EntityStore<Town>,
  {
    match kind {
      EntityKind::Bank => self.banks.refresh(ctx),
      EntityKind::Town => self.towns.refresh(ctx),
      EntityKind::CashPoint => {
        warn!("cash points are only fetched through requests");
        false
      }
    }
  }

  pub fn handle<R, S>(
    &mut self,
    request_id: RequestId,
    continuation: SyncContinuation,
    outcome: Outcome,
    ctx: &mut SyncContext<'_, R, S>,
  ) where
    R: From<SyncContinuation>,
    S: EntityStore<Bank> + EntityStore<Town>,
  {
    match continuation.kind {
      EntityKind::Bank => self.banks.handle(request_id, continuation.step, outcome, ctx),
      EntityKind::Town => self.towns.handle(request_id, continuation.step, outcome, ctx),
      EntityKind::CashPoint => warn!(%request_id, "sync result for a kind without pipeline"),
    }
  }

  pub fn phase(&self, kind: EntityKind) -> Option<PipelinePhase> {
    match kind {
      EntityKind::Bank => Some(self.banks.phase()),
      EntityKind::Town => Some(self.towns.phase()),
      EntityKind::CashPoint => None,
    }
  }

  pub fn progress(&self, kind: EntityKind) -> Option<(usize, usize)> {
    match kind {
      EntityKind::Bank => Some(self.banks.progress()),
      EntityKind::Town => Some(self.towns.progress()),
      EntityKind::CashPoint => None,
    }
  }

  pub fn is_busy(&self) -> bool {
    self.banks.is_busy() || self.towns.is_busy()
  }
}
