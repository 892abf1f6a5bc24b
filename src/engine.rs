//! The single-threaded engine that owns every piece of mutable state.
//!
//! Network tasks, the tick timer and the UI only send [`Event`]s. The engine
//! handles them one at a time, so continuations never run concurrently and
//! nothing here needs a lock.

use chrono::Utc;
use color_eyre::Result;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::api::transport::{is_pong, Network, Outcome, RequestId, Resolved, Transport};
use crate::api::types::EntityKind;
use crate::cache::{CatalogStore, IconStore};
use crate::event::{Command, Event, EventHandler};
use crate::notify::{Notification, Notifier};
use crate::request::{
  RequestContext, RequestContinuation, RequestHandle, RequestKind, RequestRegistry,
  RequestSettings, RequestState,
};
use crate::sync::{PipelinePhase, RetryBudget, SyncContext, SyncContinuation, SyncOrchestrator, SyncSettings};

/// Continuation stored in the transport callback table.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
  Sync(SyncContinuation),
  Request(RequestContinuation),
  Ping { budget: RetryBudget },
}

impl From<SyncContinuation> for Route {
  fn from(continuation: SyncContinuation) -> Self {
    Self::Sync(continuation)
  }
}

impl From<RequestContinuation> for Route {
  fn from(continuation: RequestContinuation) -> Self {
    Self::Request(continuation)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
  pub sync: SyncSettings,
  pub requests: RequestSettings,
  pub ping_attempts: u32,
  /// Callback expiry window
  pub expire_after: Duration,
  /// Where offline snapshots live; `None` disables them
  pub snapshot_dir: Option<PathBuf>,
  pub snapshot_max_age: Duration,
}

impl Default for EngineSettings {
  fn default() -> Self {
    Self {
      sync: SyncSettings::default(),
      requests: RequestSettings::default(),
      ping_attempts: 3,
      expire_after: crate::api::transport::DEFAULT_EXPIRE_AFTER,
      snapshot_dir: None,
      snapshot_max_age: crate::cache::snapshot::DEFAULT_MAX_AGE,
    }
  }
}

pub struct Engine<S> {
  transport: Transport<Route>,
  sync: SyncOrchestrator,
  requests: RequestRegistry,
  store: S,
  icons: Box<dyn IconStore>,
  notifier: Notifier,
  ping_attempts: u32,
  pinging: bool,
  reachable: Option<bool>,
}

impl<S: CatalogStore> Engine<S> {
  pub fn new(
    settings: EngineSettings,
    network: Box<dyn Network>,
    store: S,
    icons: Box<dyn IconStore>,
    notifier: Notifier,
  ) -> Result<Self> {
    let sync = SyncOrchestrator::new(
      settings.sync,
      settings.snapshot_dir.as_deref(),
      settings.snapshot_max_age,
    )?;

    Ok(Self {
      transport: Transport::new(network, settings.expire_after),
      sync,
      requests: RequestRegistry::new(settings.requests),
      store,
      icons,
      notifier,
      ping_attempts: settings.ping_attempts.max(1),
      pinging: false,
      reachable: None,
    })
  }

  pub fn store(&self) -> &S {
    &self.store
  }

  pub fn sync(&self) -> &SyncOrchestrator {
    &self.sync
  }

  /// Result of the last completed ping.
  pub fn reachable(&self) -> Option<bool> {
    self.reachable
  }

  pub fn request_state(&self, handle: RequestHandle) -> Option<RequestState> {
    self.requests.state(handle)
  }

  /// Nothing in flight and no pipeline running.
  pub fn is_idle(&self) -> bool {
    self.transport.in_flight() == 0 && !self.sync.is_busy()
  }

  // ==========================================================================
  // Events
  // ==========================================================================

  /// Handle one event. Returns false once the engine should stop.
  pub fn handle_event(&mut self, event: Event) -> bool {
    match event {
      Event::Tick => self.sweep(),
      Event::Response { id, outcome } => self.on_response(id, outcome),
      Event::Command(command) => return self.handle_command(command),
    }
    true
  }

  pub fn handle_command(&mut self, command: Command) -> bool {
    debug!(?command, "command");
    match command {
      Command::Refresh(kind) => {
        self.refresh(kind);
      }
      Command::Ping => self.ping(),
      Command::Submit { kind, json } => {
        self.submit(kind, &json);
      }
      Command::Abort(handle) => self.requests.abort(handle),
      Command::Restart { handle, step } => {
        let budget = self.requests.fresh_budget();
        self.restart(handle, step, budget);
      }
      Command::Dispose(handle) => self.requests.dispose(handle),
      Command::Shutdown => {
        info!("shutting down");
        return false;
      }
    }
    true
  }

  pub fn refresh(&mut self, kind: EntityKind) -> bool {
    let mut ctx = SyncContext {
      transport: &mut self.transport,
      store: &self.store,
      icons: self.icons.as_ref(),
      sink: &self.notifier,
    };
    self.sync.refresh(kind, &mut ctx)
  }

  pub fn submit(&mut self, kind: RequestKind, json: &str) -> RequestHandle {
    let mut ctx = RequestContext {
      transport: &mut self.transport,
      store: &self.store,
      notifier: &self.notifier,
      now: Utc::now(),
    };
    self.requests.submit(kind, json, &mut ctx)
  }

  pub fn restart(&mut self, handle: RequestHandle, step: usize, budget: RetryBudget) -> bool {
    let mut ctx = RequestContext {
      transport: &mut self.transport,
      store: &self.store,
      notifier: &self.notifier,
      now: Utc::now(),
    };
    self.requests.restart(handle, step, budget, &mut ctx)
  }

  pub fn on_response(&mut self, id: RequestId, outcome: Outcome) {
    if let Some(resolved) = self.transport.on_result(id, outcome) {
      self.resolve(resolved);
    }
  }

  /// Time out stale requests.
  pub fn sweep(&mut self) {
    self.sweep_at(Instant::now());
  }

  pub fn sweep_at(&mut self, now: Instant) {
    for resolved in self.transport.expire_stale_at(now) {
      self.resolve(resolved);
    }
  }

  fn resolve(&mut self, resolved: Resolved<Route>) {
    let Resolved {
      request_id,
      outcome,
      continuation,
    } = resolved;

    match continuation {
      Route::Sync(continuation) => {
        let mut ctx = SyncContext {
          transport: &mut self.transport,
          store: &self.store,
          icons: self.icons.as_ref(),
          sink: &self.notifier,
        };
        self.sync.handle(request_id, continuation, outcome, &mut ctx);
      }
      Route::Request(continuation) => {
        let mut ctx = RequestContext {
          transport: &mut self.transport,
          store: &self.store,
          notifier: &self.notifier,
          now: Utc::now(),
        };
        self.requests.handle(request_id, continuation, outcome, &mut ctx);
      }
      Route::Ping { budget } => self.on_ping(request_id, budget, outcome),
    }
  }

  // ==========================================================================
  // Ping
  // ==========================================================================

  /// Check that the server answers. Ignored while a ping is outstanding.
  pub fn ping(&mut self) {
    if self.pinging {
      debug!("ping already in flight");
      return;
    }
    self.pinging = true;
    self.transport.ping(Route::Ping {
      budget: RetryBudget::new(self.ping_attempts),
    });
  }

  fn on_ping(&mut self, request_id: RequestId, budget: RetryBudget, outcome: Outcome) {
    if is_pong(&outcome) {
      self.set_reachable(true);
      return;
    }

    match budget.consume() {
      Some(next) => {
        warn!(%request_id, left = next.left(), ?outcome, "ping failed, retrying");
        self.transport.ping(Route::Ping { budget: next });
      }
      None => {
        warn!(%request_id, ?outcome, "server unreachable");
        self.set_reachable(false);
      }
    }
  }

  fn set_reachable(&mut self, reachable: bool) {
    self.pinging = false;
    self.reachable = Some(reachable);
    self.notifier.emit(Notification::Reachability(reachable));
  }

  // ==========================================================================
  // Loop
  // ==========================================================================

  /// Handle events until a shutdown command or until the channel closes.
  pub async fn run(&mut self, events: &mut EventHandler) {
    while let Some(event) = events.next().await {
      if !self.handle_event(event) {
        break;
      }
    }
  }

  /// Handle events until nothing is left to wait for.
  pub async fn run_until_idle(&mut self, events: &mut EventHandler) {
    while !self.is_idle() {
      let Some(event) = events.next().await else {
        warn!("event channel closed with work outstanding");
        break;
      };
      if !self.handle_event(event) {
        break;
      }
    }
  }

  /// Phase and progress of each synchronized kind.
  pub fn summary(&self) -> Vec<(EntityKind, PipelinePhase, usize, usize)> {
    [EntityKind::Bank, EntityKind::Town]
      .into_iter()
      .filter_map(|kind| {
        let phase = self.sync.phase(kind)?;
        let (done, total) = self.sync.progress(kind)?;
        Some((kind, phase, done, total))
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::transport::{TransportErrorKind, WireRequest, PING_PATH};
  use crate::api::types::{Bank, CashPoint, Town};
  use crate::cache::{EntityStore, MemoryIconStore, MemoryStorage};
  use crate::testing::{drain, eid, ok_json, status, RecordingNetwork};
  use serde_json::json;
  use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

  fn engine() -> (Engine<MemoryStorage>, RecordingNetwork, UnboundedReceiver<Notification>) {
    let network = RecordingNetwork::default();
    let (notifier, rx) = Notifier::channel();
    let engine = Engine::new(
      EngineSettings::default(),
      Box::new(network.clone()),
      MemoryStorage::new(),
      Box::new(MemoryIconStore::new()),
      notifier,
    )
    .unwrap();
    (engine, network, rx)
  }

  fn pong() -> Outcome {
    ok_json(json!({ "text": "pong" }))
  }

  #[test]
  fn test_ping_reports_reachable() {
    let (mut engine, network, mut rx) = engine();
    engine.ping();
    engine.ping();
    let request = network.take_one();
    assert_eq!(request.path, PING_PATH);

    engine.on_response(request.id, pong());
    assert_eq!(engine.reachable(), Some(true));
    assert_eq!(drain(&mut rx), vec![Notification::Reachability(true)]);
  }

  #[test]
  fn test_ping_retries_then_reports_unreachable() {
    let (mut engine, network, mut rx) = engine();
    engine.ping();

    let first = network.take_one();
    engine.on_response(first.id, ok_json(json!({ "text": "ping" })));
    let second = network.take_one();
    engine.on_response(second.id, Outcome::TransportError(TransportErrorKind::HostNotFound));
    network.take_one();
    engine.sweep_at(Instant::now() + Duration::from_secs(5));

    assert_eq!(network.len(), 0);
    assert_eq!(engine.reachable(), Some(false));
    assert_eq!(drain(&mut rx), vec![Notification::Reachability(false)]);
    assert!(engine.is_idle());
  }

  #[test]
  fn test_town_refresh_end_to_end() {
    let (mut engine, network, mut rx) = engine();
    assert!(engine.refresh(EntityKind::Town));
    assert!(!engine.is_idle());

    let ids = network.take_one();
    engine.on_response(ids.id, ok_json(json!({ "towns": [2, 1] })));
    let batch = network.take_one();
    assert_eq!(batch.body, Some(json!({ "towns": [2, 1] })));
    engine.on_response(
      batch.id,
      ok_json(json!([{ "id": 1, "name": "Moscow" }, { "id": 2, "name": "Tula" }])),
    );

    assert!(engine.is_idle());
    let towns: Vec<Town> = engine.store().query_all().unwrap();
    assert_eq!(towns.len(), 2);
    assert_eq!(
      engine.summary(),
      vec![
        (EntityKind::Bank, PipelinePhase::Idle, 0, 0),
        (EntityKind::Town, PipelinePhase::Completed, 2, 2),
      ]
    );
    assert!(drain(&mut rx).contains(&Notification::ServerDataReceived {
      kind: EntityKind::Town
    }));
  }

  #[test]
  fn test_bank_refresh_fetches_icons() {
    let (mut engine, network, _rx) = engine();
    engine.refresh(EntityKind::Bank);

    let ids = network.take_one();
    engine.on_response(ids.id, ok_json(json!({ "banks": [5] })));
    let batch = network.take_one();
    engine.on_response(batch.id, ok_json(json!([{ "id": 5, "name": "Alfa" }])));

    let icon = network.take_one();
    assert_eq!(icon.path, "/bank/5/ico");
    assert!(!engine.is_idle());
    engine.on_response(icon.id, status(404));

    assert!(engine.is_idle());
    let bank: Option<Bank> = engine.store().query_by_id(eid(5)).unwrap();
    assert_eq!(bank.map(|b| b.name), Some("Alfa".to_string()));
  }

  #[test]
  fn test_late_response_after_sweep_is_ignored() {
    let (mut engine, network, mut rx) = engine();
    engine.refresh(EntityKind::Town);
    let ids = network.take_one();

    engine.sweep_at(Instant::now() + Duration::from_secs(5));
    // Timeout retries the id list
    let retry = network.take_one();
    assert_eq!(retry.path, "/towns");

    engine.on_response(ids.id, ok_json(json!({ "towns": [1] })));
    assert_eq!(network.len(), 0);
    assert_eq!(engine.sync().phase(EntityKind::Town), Some(PipelinePhase::FetchingIds));
    assert!(drain(&mut rx).is_empty());
  }

  #[test]
  fn test_radius_request_stores_cashpoints() {
    let (mut engine, network, mut rx) = engine();
    let input = json!({
      "longitude": 37.6, "latitude": 55.7, "radius": 300,
      "topLeft": {}, "bottomRight": {}
    });
    let handle = engine.submit(RequestKind::Radius, &input.to_string());

    let ids = network.take_one();
    assert_eq!(ids.path, "/nearby/cashpoints");
    engine.on_response(ids.id, ok_json(json!([11, 12])));
    let batch = network.take_one();
    assert_eq!(batch.body, Some(json!({ "cashpoints": [11, 12], "cached": [] })));
    engine.on_response(
      batch.id,
      ok_json(json!([{ "id": 11, "type": "atm" }, { "id": 12, "type": "office" }])),
    );

    assert_eq!(engine.request_state(handle), None);
    let stored: Vec<CashPoint> = engine.store().query_all().unwrap();
    assert_eq!(stored.len(), 2);

    let notifications = drain(&mut rx);
    assert!(notifications.iter().any(|n| matches!(
      n,
      Notification::RequestData { finished: true, response, .. } if response.cashpoints.len() == 2
    )));
    assert_eq!(
      notifications.last(),
      Some(&Notification::RequestFinished { handle, ok: true })
    );
  }

  #[test]
  fn test_commands() {
    let (mut engine, network, _rx) = engine();
    assert!(engine.handle_event(Event::Command(Command::Submit {
      kind: RequestKind::Patches,
      json: json!({ "id": 3 }).to_string(),
    })));
    let patches = network.take_one();
    assert_eq!(patches.path, "/cashpoint/3/patches");

    assert!(engine.handle_event(Event::Command(Command::Abort(RequestHandle::from_raw(1)))));
    assert_eq!(
      engine.request_state(RequestHandle::from_raw(1)),
      Some(RequestState::Aborting { dispose: false })
    );
    assert!(engine.handle_event(Event::Command(Command::Dispose(RequestHandle::from_raw(1)))));
    engine.handle_event(Event::Response {
      id: patches.id,
      outcome: ok_json(json!([])),
    });
    assert_eq!(engine.request_state(RequestHandle::from_raw(1)), None);

    assert!(!engine.handle_event(Event::Command(Command::Shutdown)));
  }

  #[test]
  fn test_request_cancellation_leaves_sync_alone() {
    let (mut engine, network, mut rx) = engine();
    engine.refresh(EntityKind::Town);
    let ids = network.take_one();
    engine.on_response(ids.id, ok_json(json!({ "towns": [1, 2, 3] })));
    let batch = network.take_one();

    let handle = engine.submit(RequestKind::Patches, &json!({ "id": 3 }).to_string());
    assert_eq!(network.take_one().path, "/cashpoint/3/patches");
    assert!(engine.handle_event(Event::Command(Command::Abort(handle))));
    assert!(engine.handle_event(Event::Command(Command::Dispose(handle))));
    assert!(engine.handle_event(Event::Command(Command::Abort(RequestHandle::from_raw(42)))));
    assert!(engine.handle_event(Event::Command(Command::Dispose(RequestHandle::from_raw(42)))));
    assert_eq!(engine.sync().phase(EntityKind::Town), Some(PipelinePhase::FetchingData));

    // Both calls time out; only the batch comes back, unchanged
    engine.sweep_at(Instant::now() + Duration::from_secs(5));
    assert_eq!(engine.request_state(handle), None);
    let retry = network.take_one();
    assert_eq!(retry.path, batch.path);
    assert_eq!(retry.body, Some(json!({ "towns": [1, 2, 3] })));

    engine.sweep_at(Instant::now() + Duration::from_secs(5));
    let last = network.take_one();
    assert_eq!(last.body, batch.body);
    engine.sweep_at(Instant::now() + Duration::from_secs(5));

    assert_eq!(network.len(), 0);
    assert_eq!(engine.sync().phase(EntityKind::Town), Some(PipelinePhase::Failed));
    assert!(engine.is_idle());
    assert!(drain(&mut rx)
      .iter()
      .any(|n| matches!(n, Notification::SyncError { kind: EntityKind::Town, .. })));
  }

  #[test]
  fn test_restart_command_resumes_aborted_request() {
    let (mut engine, network, _rx) = engine();
    let input = json!({
      "longitude": 37.6, "latitude": 55.7, "radius": 300,
      "topLeft": {}, "bottomRight": {}
    });
    let handle = engine.submit(RequestKind::Radius, &input.to_string());
    let ids = network.take_one();
    engine.handle_command(Command::Abort(handle));
    engine.on_response(ids.id, ok_json(json!([11])));
    assert_eq!(engine.request_state(handle), Some(RequestState::Idle));
    assert_eq!(network.len(), 0);

    assert!(engine.handle_command(Command::Restart { handle, step: 0 }));
    assert_eq!(engine.request_state(handle), Some(RequestState::Running { step: 0 }));
    assert_eq!(network.take_one().path, "/nearby/cashpoints");

    assert!(!engine.restart(handle, 0, RetryBudget::new(1)));
  }

  /// Answers every request from a task, like the HTTP backend does.
  struct ScriptedNetwork {
    events: UnboundedSender<Event>,
  }

  impl Network for ScriptedNetwork {
    fn dispatch(&self, request: WireRequest) {
      let outcome = match request.path.as_str() {
        PING_PATH => pong(),
        "/towns" if request.body.is_none() => ok_json(json!({ "towns": [1, 2, 3] })),
        "/towns" => ok_json(json!([{ "id": 1 }, { "id": 2 }, { "id": 3 }])),
        _ => status(404),
      };
      let events = self.events.clone();
      tokio::spawn(async move {
        let _ = events.send(Event::Response {
          id: request.id,
          outcome,
        });
      });
    }
  }

  #[tokio::test]
  async fn test_run_until_idle() {
    let mut events = EventHandler::new(Duration::from_millis(50));
    let (notifier, _rx) = Notifier::channel();
    let mut engine = Engine::new(
      EngineSettings::default(),
      Box::new(ScriptedNetwork {
        events: events.sender(),
      }),
      MemoryStorage::new(),
      Box::new(MemoryIconStore::new()),
      notifier,
    )
    .unwrap();

    engine.ping();
    engine.refresh(EntityKind::Town);
    engine.run_until_idle(&mut events).await;

    assert_eq!(engine.reachable(), Some(true));
    assert_eq!(engine.sync().phase(EntityKind::Town), Some(PipelinePhase::Completed));
    assert_eq!(engine.sync().progress(EntityKind::Town), Some((3, 3)));
  }
}
