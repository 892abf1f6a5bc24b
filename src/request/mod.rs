//! Cancellable multi-step requests started by user actions.
//!
//! A request is an ordered list of named steps. Each step sends one call and
//! decides from the reply whether to retry, repeat, fail the request or move
//! on. Requests live in a registry keyed by handle; a request whose call is
//! still in flight is never dropped, it is marked as aborting and removed
//! once the transport resolves that call.

mod cashpoint;

pub use cashpoint::{
  AreaQuery, CashPointEdit, CashPointResponse, ClusterQuery, ClusterRequest, CreateRequest,
  EditRequest, NewCashPoint, PatchesQuery, PatchesRequest, RadiusRequest, RequestKind,
  ResponseKind,
};

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::transport::{Outcome, RequestId, Transport, ATTEMPTS_EXHAUSTED};
use crate::api::types::{CashPoint, EntityId};
use crate::cache::{CachedEntity, EntityStore};
use crate::notify::{Notification, Notifier};
use crate::sync::RetryBudget;

/// Consumer-facing id of a multi-step request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestHandle(u64);

impl RequestHandle {
  pub fn get(self) -> u64 {
    self.0
  }

  #[cfg(test)]
  pub(crate) fn from_raw(raw: u64) -> Self {
    Self(raw)
  }
}

impl fmt::Display for RequestHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
  Idle,
  Running { step: usize },
  Succeeded,
  Failed { step: usize },
  /// Cancelled while a call was in flight; waits for that call to resolve.
  Aborting { dispose: bool },
  Disposed,
}

impl RequestState {
  pub fn is_terminal(self) -> bool {
    matches!(self, Self::Succeeded | Self::Failed { .. } | Self::Disposed)
  }
}

/// Only one request per slot may be outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestSlot {
  /// Map queries: radius and cluster
  Map,
  /// Create and edit
  Edit,
  Patches,
}

/// Continuation stored with every request call.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContinuation {
  pub handle: RequestHandle,
  pub step: usize,
  pub budget: RetryBudget,
}

/// A call a step wants sent.
#[derive(Debug, Clone, PartialEq)]
pub struct StepCall {
  pub path: String,
  pub body: Option<Value>,
}

impl StepCall {
  pub fn get(path: impl Into<String>) -> Self {
    Self {
      path: path.into(),
      body: None,
    }
  }

  pub fn post(path: impl Into<String>, body: Value) -> Self {
    Self {
      path: path.into(),
      body: Some(body),
    }
  }
}

/// What a step decided after looking at a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
  /// Send the same step again with one attempt less.
  Retry { reason: String },
  /// Send the same step again with a full budget.
  Repeat,
  /// Fail the whole request at this step.
  Fail { message: String },
  /// The step is done; `ok` moves on to the next step or ends the request.
  Finished { ok: bool, message: String },
  /// Nothing left to do, the request succeeded without running later steps.
  Complete { message: String },
}

/// Local cash point lookups available to steps.
pub trait CashPointStore {
  fn cached(&self, id: EntityId) -> Option<CachedEntity<CashPoint>>;
  fn save(&self, cashpoint: &CashPoint);
}

impl<S: EntityStore<CashPoint>> CashPointStore for S {
  fn cached(&self, id: EntityId) -> Option<CachedEntity<CashPoint>> {
    self.query_entry(id).unwrap_or_else(|e| {
      warn!(%id, "failed to read cached cash point: {}", e);
      None
    })
  }

  fn save(&self, cashpoint: &CashPoint) {
    if let Err(e) = self.upsert(cashpoint) {
      warn!(id = %cashpoint.id, "failed to store cash point: {}", e);
    }
  }
}

/// Read-only view steps get while preparing calls and reading replies.
pub struct StepContext<'a> {
  pub store: &'a dyn CashPointStore,
  pub batch_size: usize,
  pub now: DateTime<Utc>,
  /// Stored cash points younger than this are not fetched again
  pub fresh_for: Duration,
}

impl StepContext<'_> {
  pub fn is_fresh(&self, synced_at: DateTime<Utc>) -> bool {
    match (self.now - synced_at).to_std() {
      Ok(age) => age < self.fresh_for,
      // Synced "in the future": clock moved back
      Err(_) => true,
    }
  }
}

/// The concrete logic of one kind of request.
pub trait RequestBehavior: Send {
  fn name(&self) -> &'static str;

  fn slot(&self) -> RequestSlot;

  /// Step names, in order.
  fn steps(&self) -> &'static [&'static str];

  /// Build the call for `step`. Called again for every retry of the step.
  fn prepare(&mut self, step: usize, ctx: &StepContext<'_>) -> StepCall;

  /// Interpret a server reply for `step`.
  fn on_reply(&mut self, step: usize, status: u16, body: &[u8], ctx: &StepContext<'_>)
    -> StepOutcome;

  /// Response data produced by the last reply, if any.
  fn take_response(&mut self) -> Option<CashPointResponse>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestSettings {
  pub attempts: u32,
  pub batch_size: usize,
  pub fresh_for: Duration,
}

impl Default for RequestSettings {
  fn default() -> Self {
    Self {
      attempts: 3,
      batch_size: 128,
      fresh_for: Duration::from_secs(300),
    }
  }
}

/// Collaborators a request needs while handling one event.
pub struct RequestContext<'a, R> {
  pub transport: &'a mut Transport<R>,
  pub store: &'a dyn CashPointStore,
  pub notifier: &'a Notifier,
  pub now: DateTime<Utc>,
}

pub struct MultiStepRequest {
  handle: RequestHandle,
  behavior: Box<dyn RequestBehavior>,
  steps: Vec<&'static str>,
  state: RequestState,
  in_flight: Option<RequestId>,
  settings: RequestSettings,
}

impl MultiStepRequest {
  pub fn new(
    handle: RequestHandle,
    behavior: Box<dyn RequestBehavior>,
    settings: RequestSettings,
  ) -> Self {
    let steps = behavior.steps();
    let mut request = Self {
      handle,
      behavior,
      steps: Vec::new(),
      state: RequestState::Idle,
      in_flight: None,
      settings,
    };
    request.register_steps(steps);
    request
  }

  fn register_steps(&mut self, names: &[&'static str]) {
    debug_assert!(
      self.steps.is_empty(),
      "steps of request {} registered twice",
      self.handle
    );
    self.steps = names.to_vec();
  }

  pub fn handle(&self) -> RequestHandle {
    self.handle
  }

  pub fn state(&self) -> RequestState {
    self.state
  }

  pub fn name(&self) -> &'static str {
    self.behavior.name()
  }

  pub fn slot(&self) -> RequestSlot {
    self.behavior.slot()
  }

  fn fresh_budget(&self) -> RetryBudget {
    RetryBudget::new(self.settings.attempts)
  }

  fn step_context<'a>(&self, store: &'a dyn CashPointStore, now: DateTime<Utc>) -> StepContext<'a> {
    StepContext {
      store,
      batch_size: self.settings.batch_size,
      now,
      fresh_for: self.settings.fresh_for,
    }
  }

  /// Run from `step` with the given budget. Only an idle request can be
  /// started; returns false when nothing was sent.
  pub fn start<R>(&mut self, budget: RetryBudget, step: usize, ctx: &mut RequestContext<'_, R>) -> bool
  where
    R: From<RequestContinuation>,
  {
    if self.state != RequestState::Idle || step >= self.steps.len() {
      warn!(handle = %self.handle, state = ?self.state, step, "request cannot be started");
      return false;
    }
    info!(handle = %self.handle, name = self.name(), step, "starting request");
    self.dispatch(step, budget, ctx);
    true
  }

  fn dispatch<R>(&mut self, step: usize, budget: RetryBudget, ctx: &mut RequestContext<'_, R>)
  where
    R: From<RequestContinuation>,
  {
    let call = {
      let step_ctx = self.step_context(ctx.store, ctx.now);
      self.behavior.prepare(step, &step_ctx)
    };

    debug!(handle = %self.handle, step, name = self.steps[step], left = budget.left(), "sending step");
    self.state = RequestState::Running { step };
    let id = ctx.transport.send(
      call.path,
      call.body,
      RequestContinuation {
        handle: self.handle,
        step,
        budget,
      },
    );
    self.in_flight = Some(id);
  }

  /// Mark the request as cancelled. A call in flight will be ignored.
  pub fn abort(&mut self) {
    match self.state {
      RequestState::Running { .. } => {
        info!(handle = %self.handle, "request aborted");
        self.state = RequestState::Aborting { dispose: false };
      }
      _ => debug!(handle = %self.handle, state = ?self.state, "nothing to abort"),
    }
  }

  /// Ask for destruction. Returns true when the request can be dropped now;
  /// otherwise it is dropped once its in-flight call resolves.
  pub fn dispose(&mut self) -> bool {
    match self.state {
      RequestState::Running { .. } | RequestState::Aborting { .. } if self.in_flight.is_some() => {
        self.state = RequestState::Aborting { dispose: true };
        false
      }
      _ => {
        self.state = RequestState::Disposed;
        true
      }
    }
  }

  /// Resolve this request's in-flight call.
  pub fn on_result<R>(
    &mut self,
    request_id: RequestId,
    continuation: RequestContinuation,
    outcome: Outcome,
    ctx: &mut RequestContext<'_, R>,
  ) where
    R: From<RequestContinuation>,
  {
    if self.in_flight != Some(request_id) {
      warn!(handle = %self.handle, %request_id, "result for a call this request no longer waits for");
      return;
    }
    self.in_flight = None;

    let step = match self.state {
      RequestState::Aborting { dispose } => {
        debug!(handle = %self.handle, %request_id, "completion after abort ignored");
        self.state = if dispose {
          RequestState::Disposed
        } else {
          RequestState::Idle
        };
        return;
      }
      RequestState::Running { step } if step == continuation.step => step,
      state => {
        warn!(handle = %self.handle, ?state, step = continuation.step, "unexpected request result");
        return;
      }
    };

    let outcome = match outcome {
      Outcome::Timeout => StepOutcome::Retry {
        reason: ATTEMPTS_EXHAUSTED.to_string(),
      },
      Outcome::TransportError(kind) => StepOutcome::Fail {
        message: kind.message().to_string(),
      },
      Outcome::Ok { status, body } => {
        let step_ctx = self.step_context(ctx.store, ctx.now);
        self.behavior.on_reply(step, status, &body, &step_ctx)
      }
    };

    let last_step = step + 1 == self.steps.len();
    if let Some(response) = self.behavior.take_response() {
      for cashpoint in &response.cashpoints {
        ctx.store.save(cashpoint);
      }
      let finished = match &outcome {
        StepOutcome::Complete { .. } => true,
        StepOutcome::Finished { ok: true, .. } => last_step,
        _ => false,
      };
      ctx.notifier.emit(Notification::RequestData {
        handle: self.handle,
        finished,
        response,
      });
    }

    match outcome {
      StepOutcome::Retry { reason } => match continuation.budget.consume() {
        Some(next) => {
          warn!(handle = %self.handle, step, left = next.left(), "retrying step: {}", reason);
          self.dispatch(step, next, ctx);
        }
        None => self.fail(step, &reason, ctx),
      },
      StepOutcome::Repeat => self.dispatch(step, self.fresh_budget(), ctx),
      StepOutcome::Fail { message } => self.fail(step, &message, ctx),
      StepOutcome::Finished { ok, message } => {
        self.emit_step(step, ok, message, ctx);
        if !ok {
          self.finish(RequestState::Failed { step }, ctx);
        } else if last_step {
          self.finish(RequestState::Succeeded, ctx);
        } else {
          self.dispatch(step + 1, self.fresh_budget(), ctx);
        }
      }
      StepOutcome::Complete { message } => {
        self.emit_step(step, true, message, ctx);
        self.finish(RequestState::Succeeded, ctx);
      }
    }
  }

  fn emit_step<R>(&self, step: usize, ok: bool, message: String, ctx: &RequestContext<'_, R>) {
    ctx.notifier.emit(Notification::RequestStep {
      handle: self.handle,
      step,
      ok,
      message,
    });
  }

  fn fail<R>(&mut self, step: usize, message: &str, ctx: &RequestContext<'_, R>) {
    warn!(
      handle = %self.handle,
      step,
      "step {} of {} ({}) failed: {}",
      step + 1,
      self.steps.len(),
      self.steps[step],
      message
    );
    ctx.notifier.emit(Notification::RequestError {
      handle: self.handle,
      step,
      message: message.to_string(),
    });
    self.emit_step(step, false, message.to_string(), ctx);
    self.finish(RequestState::Failed { step }, ctx);
  }

  fn finish<R>(&mut self, state: RequestState, ctx: &RequestContext<'_, R>) {
    self.state = state;
    let ok = state == RequestState::Succeeded;
    info!(handle = %self.handle, name = self.name(), ok, "request finished");
    ctx.notifier.emit(Notification::RequestFinished {
      handle: self.handle,
      ok,
    });
  }
}

/// Owns every live request.
pub struct RequestRegistry {
  requests: BTreeMap<RequestHandle, MultiStepRequest>,
  slots: HashMap<RequestSlot, RequestHandle>,
  last_handle: u64,
  settings: RequestSettings,
}

impl RequestRegistry {
  pub fn new(settings: RequestSettings) -> Self {
    Self {
      requests: BTreeMap::new(),
      slots: HashMap::new(),
      last_handle: 0,
      settings,
    }
  }

  /// Full retry budget for a step.
  pub fn fresh_budget(&self) -> RetryBudget {
    RetryBudget::new(self.settings.attempts)
  }

  fn next_handle(&mut self) -> RequestHandle {
    self.last_handle += 1;
    RequestHandle(self.last_handle)
  }

  /// Parse `json` as input for `kind` and start the request.
  ///
  /// Bad input is reported through notifications before anything is sent.
  pub fn submit<R>(
    &mut self,
    kind: RequestKind,
    json: &str,
    ctx: &mut RequestContext<'_, R>,
  ) -> RequestHandle
  where
    R: From<RequestContinuation>,
  {
    match kind.parse(json) {
      Ok(behavior) => self.submit_behavior(behavior, ctx),
      Err(message) => {
        let handle = self.next_handle();
        warn!(%handle, kind = kind.name(), "rejected request input: {}", message);
        ctx.notifier.emit(Notification::RequestError {
          handle,
          step: 0,
          message,
        });
        ctx.notifier.emit(Notification::RequestFinished { handle, ok: false });
        handle
      }
    }
  }

  /// Start a prepared request, replacing whatever occupied its slot.
  pub fn submit_behavior<R>(
    &mut self,
    behavior: Box<dyn RequestBehavior>,
    ctx: &mut RequestContext<'_, R>,
  ) -> RequestHandle
  where
    R: From<RequestContinuation>,
  {
    let slot = behavior.slot();
    if let Some(previous) = self.slots.remove(&slot) {
      debug!(handle = %previous, ?slot, "replacing request in slot");
      self.dispose(previous);
    }

    let handle = self.next_handle();
    let mut request = MultiStepRequest::new(handle, behavior, self.settings);
    request.start(self.fresh_budget(), 0, ctx);

    if !request.state().is_terminal() {
      self.slots.insert(slot, handle);
      self.requests.insert(handle, request);
    }
    handle
  }

  /// Run an idle request again from `step`. Returns false for unknown or
  /// busy requests and for steps past the last one.
  pub fn restart<R>(
    &mut self,
    handle: RequestHandle,
    step: usize,
    budget: RetryBudget,
    ctx: &mut RequestContext<'_, R>,
  ) -> bool
  where
    R: From<RequestContinuation>,
  {
    match self.requests.get_mut(&handle) {
      Some(request) => request.start(budget, step, ctx),
      None => {
        debug!(%handle, "restart for unknown request");
        false
      }
    }
  }

  pub fn abort(&mut self, handle: RequestHandle) {
    match self.requests.get_mut(&handle) {
      Some(request) => request.abort(),
      None => debug!(%handle, "abort for unknown request"),
    }
  }

  pub fn dispose(&mut self, handle: RequestHandle) {
    let Some(request) = self.requests.get_mut(&handle) else {
      debug!(%handle, "dispose for unknown request");
      return;
    };
    if request.dispose() {
      self.remove(handle);
    } else {
      debug!(%handle, "dispose deferred until in-flight call resolves");
    }
  }

  pub fn handle<R>(
    &mut self,
    request_id: RequestId,
    continuation: RequestContinuation,
    outcome: Outcome,
    ctx: &mut RequestContext<'_, R>,
  ) where
    R: From<RequestContinuation>,
  {
    let handle = continuation.handle;
    let Some(request) = self.requests.get_mut(&handle) else {
      debug!(%handle, %request_id, "result for a request that is gone");
      return;
    };

    request.on_result(request_id, continuation, outcome, ctx);
    if request.state().is_terminal() {
      self.remove(handle);
    }
  }

  fn remove(&mut self, handle: RequestHandle) {
    if let Some(request) = self.requests.remove(&handle) {
      if self.slots.get(&request.slot()) == Some(&handle) {
        self.slots.remove(&request.slot());
      }
    }
  }

  pub fn state(&self, handle: RequestHandle) -> Option<RequestState> {
    self.requests.get(&handle).map(MultiStepRequest::state)
  }

  /// Live requests, including ones waiting for deferred disposal.
  pub fn len(&self) -> usize {
    self.requests.len()
  }

  pub fn is_empty(&self) -> bool {
    self.requests.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::transport::{TransportErrorKind, DEFAULT_EXPIRE_AFTER};
  use crate::cache::MemoryStorage;
  use crate::testing::{drain, ok_json, status, RecordingNetwork};
  use serde_json::json;
  use tokio::sync::mpsc::UnboundedReceiver;

  /// Two steps, each a single GET.
  struct TwoSteps {
    response: Option<CashPointResponse>,
  }

  impl RequestBehavior for TwoSteps {
    fn name(&self) -> &'static str {
      "two"
    }

    fn slot(&self) -> RequestSlot {
      RequestSlot::Patches
    }

    fn steps(&self) -> &'static [&'static str] {
      &["first", "second"]
    }

    fn prepare(&mut self, step: usize, _ctx: &StepContext<'_>) -> StepCall {
      StepCall::get(format!("/step/{}", step))
    }

    fn on_reply(&mut self, step: usize, status: u16, _body: &[u8], _ctx: &StepContext<'_>) -> StepOutcome {
      match status {
        200 => {
          if step == 1 {
            self.response = Some(CashPointResponse::message(ResponseKind::Patches, "done"));
          }
          StepOutcome::Finished {
            ok: true,
            message: format!("step {} ok", step),
          }
        }
        500 => StepOutcome::Retry {
          reason: "Server http response: 500".to_string(),
        },
        other => StepOutcome::Fail {
          message: format!("Server http response: {}", other),
        },
      }
    }

    fn take_response(&mut self) -> Option<CashPointResponse> {
      self.response.take()
    }
  }

  struct Harness {
    transport: Transport<RequestContinuation>,
    network: RecordingNetwork,
    store: MemoryStorage,
    notifier: Notifier,
    rx: UnboundedReceiver<Notification>,
    registry: RequestRegistry,
  }

  impl Harness {
    fn new() -> Self {
      let network = RecordingNetwork::default();
      let (notifier, rx) = Notifier::channel();
      Self {
        transport: Transport::new(Box::new(network.clone()), DEFAULT_EXPIRE_AFTER),
        network,
        store: MemoryStorage::new(),
        notifier,
        rx,
        registry: RequestRegistry::new(RequestSettings::default()),
      }
    }

    fn submit(&mut self) -> RequestHandle {
      let mut ctx = RequestContext {
        transport: &mut self.transport,
        store: &self.store,
        notifier: &self.notifier,
        now: Utc::now(),
      };
      self
        .registry
        .submit_behavior(Box::new(TwoSteps { response: None }), &mut ctx)
    }

    fn restart(&mut self, handle: RequestHandle, step: usize, budget: RetryBudget) -> bool {
      let mut ctx = RequestContext {
        transport: &mut self.transport,
        store: &self.store,
        notifier: &self.notifier,
        now: Utc::now(),
      };
      self.registry.restart(handle, step, budget, &mut ctx)
    }

    fn resolve(&mut self, id: RequestId, outcome: Outcome) {
      let Some(resolved) = self.transport.on_result(id, outcome) else {
        return;
      };
      let mut ctx = RequestContext {
        transport: &mut self.transport,
        store: &self.store,
        notifier: &self.notifier,
        now: Utc::now(),
      };
      self
        .registry
        .handle(resolved.request_id, resolved.continuation, resolved.outcome, &mut ctx);
    }

    fn respond(&mut self, outcome: Outcome) {
      let request = self.network.take_one();
      self.resolve(request.id, outcome);
    }

    fn notifications(&mut self) -> Vec<Notification> {
      drain(&mut self.rx)
    }
  }

  #[test]
  fn test_steps_advance_on_success() {
    let mut h = Harness::new();
    let handle = h.submit();
    assert_eq!(h.registry.state(handle), Some(RequestState::Running { step: 0 }));

    h.respond(ok_json(json!({})));
    assert_eq!(h.registry.state(handle), Some(RequestState::Running { step: 1 }));
    assert_eq!(h.network.take_one().path, "/step/1");
  }

  #[test]
  fn test_success_emits_data_then_finish() {
    let mut h = Harness::new();
    let handle = h.submit();
    h.respond(ok_json(json!({})));
    h.respond(ok_json(json!({})));

    assert_eq!(h.registry.state(handle), None);
    let notifications = h.notifications();
    assert_eq!(
      notifications.last(),
      Some(&Notification::RequestFinished { handle, ok: true })
    );
    assert!(notifications.iter().any(|n| matches!(
      n,
      Notification::RequestData { finished: true, response, .. } if response.message == "done"
    )));
  }

  #[test]
  fn test_retry_then_refill_on_next_step() {
    let mut h = Harness::new();
    h.submit();
    h.respond(status(500));
    h.respond(Outcome::Timeout);

    // Third attempt of step 0 succeeds, step 1 starts with a full budget
    let third = h.network.take_one();
    assert_eq!(third.path, "/step/0");
    h.resolve(third.id, ok_json(json!({})));

    let next = h.network.take_one();
    let resolved = h.transport.on_result(next.id, Outcome::Timeout).unwrap();
    assert_eq!(resolved.continuation.step, 1);
    assert_eq!(resolved.continuation.budget.left(), 3);
  }

  #[test]
  fn test_exhausted_budget_fails_with_step_index() {
    let mut h = Harness::new();
    let handle = h.submit();
    h.respond(ok_json(json!({})));
    for _ in 0..3 {
      h.respond(Outcome::Timeout);
    }

    assert_eq!(h.network.len(), 0);
    let notifications = h.notifications();
    assert!(notifications.contains(&Notification::RequestError {
      handle,
      step: 1,
      message: ATTEMPTS_EXHAUSTED.to_string(),
    }));
    assert!(notifications.contains(&Notification::RequestFinished { handle, ok: false }));
  }

  #[test]
  fn test_transport_error_fails_without_retry() {
    let mut h = Harness::new();
    let handle = h.submit();
    h.respond(Outcome::TransportError(TransportErrorKind::ConnectionRefused));

    assert_eq!(h.network.len(), 0);
    assert!(h.notifications().contains(&Notification::RequestError {
      handle,
      step: 0,
      message: TransportErrorKind::ConnectionRefused.message().to_string(),
    }));
  }

  #[test]
  fn test_abort_ignores_in_flight_completion() {
    let mut h = Harness::new();
    let handle = h.submit();
    h.registry.abort(handle);
    assert_eq!(
      h.registry.state(handle),
      Some(RequestState::Aborting { dispose: false })
    );

    h.respond(ok_json(json!({})));
    assert_eq!(h.network.len(), 0);
    assert_eq!(h.registry.state(handle), Some(RequestState::Idle));
    assert!(h.notifications().is_empty());
  }

  #[test]
  fn test_dispose_in_flight_is_deferred() {
    let mut h = Harness::new();
    let handle = h.submit();
    let pending = h.network.take_one();

    h.registry.dispose(handle);
    assert_eq!(
      h.registry.state(handle),
      Some(RequestState::Aborting { dispose: true })
    );
    assert_eq!(h.registry.len(), 1);

    h.resolve(pending.id, ok_json(json!({})));
    assert_eq!(h.registry.state(handle), None);
    assert_eq!(h.network.len(), 0);
    assert!(h.notifications().is_empty());
  }

  #[test]
  fn test_dispose_after_expiry_resolution() {
    let mut h = Harness::new();
    let handle = h.submit();
    let pending = h.network.take_one();
    h.registry.dispose(handle);

    let expired = h
      .transport
      .expire_stale_at(std::time::Instant::now() + Duration::from_secs(5));
    assert_eq!(expired.len(), 1);
    for resolved in expired {
      let mut ctx = RequestContext {
        transport: &mut h.transport,
        store: &h.store,
        notifier: &h.notifier,
        now: Utc::now(),
      };
      h.registry
        .handle(resolved.request_id, resolved.continuation, resolved.outcome, &mut ctx);
    }
    assert!(h.registry.is_empty());

    // The real answer arriving late is a no-op
    h.resolve(pending.id, ok_json(json!({})));
    assert!(h.notifications().is_empty());
  }

  #[test]
  fn test_dispose_idle_request_is_immediate() {
    let mut h = Harness::new();
    let handle = h.submit();
    h.registry.abort(handle);
    h.respond(ok_json(json!({})));
    assert_eq!(h.registry.state(handle), Some(RequestState::Idle));

    h.registry.dispose(handle);
    assert!(h.registry.is_empty());
  }

  #[test]
  fn test_aborted_request_restarts_at_step() {
    let mut h = Harness::new();
    let handle = h.submit();
    h.registry.abort(handle);
    h.respond(ok_json(json!({})));
    assert_eq!(h.registry.state(handle), Some(RequestState::Idle));

    assert!(h.restart(handle, 1, RetryBudget::new(2)));
    assert_eq!(h.registry.state(handle), Some(RequestState::Running { step: 1 }));

    let call = h.network.take_one();
    assert_eq!(call.path, "/step/1");
    let resolved = h.transport.on_result(call.id, Outcome::Timeout).unwrap();
    assert_eq!(resolved.continuation.step, 1);
    assert_eq!(resolved.continuation.budget.left(), 2);
  }

  #[test]
  fn test_restart_rejects_busy_request_and_unknown_step() {
    let mut h = Harness::new();
    let handle = h.submit();
    assert!(!h.restart(handle, 0, RetryBudget::new(3)));
    assert_eq!(h.registry.state(handle), Some(RequestState::Running { step: 0 }));

    h.registry.abort(handle);
    h.respond(ok_json(json!({})));
    assert!(!h.restart(handle, 2, RetryBudget::new(3)));
    assert_eq!(h.registry.state(handle), Some(RequestState::Idle));
    assert_eq!(h.network.len(), 0);

    assert!(!h.restart(RequestHandle(99), 0, RetryBudget::new(3)));
  }

  #[test]
  fn test_new_request_replaces_slot() {
    let mut h = Harness::new();
    let first = h.submit();
    let first_call = h.network.take_one();
    let second = h.submit();

    assert_eq!(
      h.registry.state(first),
      Some(RequestState::Aborting { dispose: true })
    );
    assert_eq!(h.registry.state(second), Some(RequestState::Running { step: 0 }));

    h.resolve(first_call.id, ok_json(json!({})));
    assert_eq!(h.registry.state(first), None);
    assert_eq!(h.registry.state(second), Some(RequestState::Running { step: 0 }));
  }

  #[test]
  fn test_invalid_input_is_rejected_before_sending() {
    let mut h = Harness::new();
    let mut ctx = RequestContext {
      transport: &mut h.transport,
      store: &h.store,
      notifier: &h.notifier,
      now: Utc::now(),
    };
    let handle = h.registry.submit(RequestKind::Radius, "{oops", &mut ctx);

    assert_eq!(h.network.len(), 0);
    assert!(h.registry.is_empty());
    let notifications = h.notifications();
    assert!(notifications.contains(&Notification::RequestError {
      handle,
      step: 0,
      message: "radius malformed json".to_string(),
    }));
    assert!(notifications.contains(&Notification::RequestFinished { handle, ok: false }));
  }

  #[test]
  #[cfg(debug_assertions)]
  #[should_panic(expected = "registered twice")]
  fn test_double_step_registration_panics() {
    let mut request = MultiStepRequest::new(
      RequestHandle(1),
      Box::new(TwoSteps { response: None }),
      RequestSettings::default(),
    );
    request.register_steps(&["again"]);
  }
}
