//! Request bookkeeping between the engine and the network.
//!
//! Every outbound request gets a unique id and a cached continuation. The
//! continuation is handed back exactly once: on the network result, or on
//! expiry when no result arrived within the expiry window. Whatever comes
//! later for the same id is logged and dropped.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::api_types::ApiMessage;

/// Health check endpoint
pub const PING_PATH: &str = "/ping";

/// Default time a request may stay unresolved before it is timed out.
pub const DEFAULT_EXPIRE_AFTER: Duration = Duration::from_millis(1000);

/// Unique id of an outbound request. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(NonZeroU32);

impl RequestId {
  pub fn from_raw(raw: u32) -> Option<Self> {
    NonZeroU32::new(raw).map(Self)
  }

  pub fn get(self) -> u32 {
    self.0.get()
  }
}

impl fmt::Display for RequestId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Network level failure, as opposed to an application status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
  ConnectionRefused,
  HostNotFound,
  Unknown,
}

impl TransportErrorKind {
  /// User facing description of the failure.
  pub fn message(self) -> &'static str {
    match self {
      Self::ConnectionRefused => {
        "Connection refused by server. Please, check your internet connection \
         and make sure that you use recent application version."
      }
      Self::HostNotFound => {
        "Sorry, server is unavailable now. Please, check your internet connection \
         and make sure that you use recent application version."
      }
      Self::Unknown => {
        "Unknown server connection error. Please, check your internet connection \
         and make sure that you use recent application version."
      }
    }
  }
}

/// Message reported when a retry budget runs out on timeouts.
pub const ATTEMPTS_EXHAUSTED: &str = "Could not connect to server after several attempts.";

/// How a request was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
  /// The server answered; `status` may still be an application error.
  Ok { status: u16, body: Vec<u8> },
  /// No answer within the expiry window.
  Timeout,
  TransportError(TransportErrorKind),
}

impl Outcome {
  pub fn is_success(&self) -> bool {
    matches!(self, Self::Ok { status, .. } if (200..300).contains(status))
  }
}

/// A request as handed to the network layer.
#[derive(Debug, Clone, PartialEq)]
pub struct WireRequest {
  pub id: RequestId,
  pub path: String,
  /// `None` is sent as GET, anything else as a JSON POST.
  pub body: Option<Value>,
}

/// Fire-and-forget network backend. Results come back through the engine's
/// event channel as `(RequestId, Outcome)` pairs.
pub trait Network: Send {
  fn dispatch(&self, request: WireRequest);
}

/// A continuation held until its request is resolved.
#[derive(Debug)]
struct CachedCallback<C> {
  created_at: Instant,
  continuation: C,
}

/// A resolved request together with its continuation.
#[derive(Debug)]
pub struct Resolved<C> {
  pub request_id: RequestId,
  pub outcome: Outcome,
  pub continuation: C,
}

/// Callback table and id allocator for outbound requests.
pub struct Transport<C> {
  network: Box<dyn Network>,
  callbacks: HashMap<RequestId, CachedCallback<C>>,
  last_id: u32,
  expire_after: Duration,
}

impl<C> Transport<C> {
  pub fn new(network: Box<dyn Network>, expire_after: Duration) -> Self {
    Self {
      network,
      callbacks: HashMap::new(),
      last_id: 0,
      expire_after,
    }
  }

  /// Number of requests still waiting for a resolution.
  pub fn in_flight(&self) -> usize {
    self.callbacks.len()
  }

  pub fn is_pending(&self, id: RequestId) -> bool {
    self.callbacks.contains_key(&id)
  }

  fn next_request_id(&mut self) -> RequestId {
    loop {
      self.last_id = if self.last_id == u32::MAX {
        1
      } else {
        self.last_id + 1
      };
      let id = RequestId(NonZeroU32::new(self.last_id).unwrap_or(NonZeroU32::MIN));
      // After a wrap an id may still be owned by a long running request
      if !self.callbacks.contains_key(&id) {
        return id;
      }
    }
  }

  /// Send a request and remember its continuation. Returns immediately.
  pub fn send(
    &mut self,
    path: impl Into<String>,
    body: Option<Value>,
    continuation: impl Into<C>,
  ) -> RequestId {
    self.send_at(path, body, continuation, Instant::now())
  }

  pub fn send_at(
    &mut self,
    path: impl Into<String>,
    body: Option<Value>,
    continuation: impl Into<C>,
    now: Instant,
  ) -> RequestId {
    let id = self.next_request_id();
    let path = path.into();
    debug!(request_id = %id, %path, post = body.is_some(), "sending request");

    self.callbacks.insert(
      id,
      CachedCallback {
        created_at: now,
        continuation: continuation.into(),
      },
    );
    self.network.dispatch(WireRequest { id, path, body });
    id
  }

  /// Send the health check request.
  pub fn ping(&mut self, continuation: impl Into<C>) -> RequestId {
    self.send(PING_PATH, None, continuation)
  }

  /// Resolve a request with a network result.
  ///
  /// Unknown ids (stray, duplicate, or already expired) are logged and ignored.
  pub fn on_result(&mut self, id: RequestId, outcome: Outcome) -> Option<Resolved<C>> {
    match self.callbacks.remove(&id) {
      Some(callback) => Some(Resolved {
        request_id: id,
        outcome,
        continuation: callback.continuation,
      }),
      None => {
        warn!(request_id = %id, "response for unknown request id");
        None
      }
    }
  }

  /// Time out every request older than the expiry window.
  pub fn expire_stale(&mut self) -> Vec<Resolved<C>> {
    self.expire_stale_at(Instant::now())
  }

  pub fn expire_stale_at(&mut self, now: Instant) -> Vec<Resolved<C>> {
    let mut expired: Vec<RequestId> = self
      .callbacks
      .iter()
      .filter(|(_, cb)| now.saturating_duration_since(cb.created_at) > self.expire_after)
      .map(|(id, _)| *id)
      .collect();
    expired.sort();

    expired
      .into_iter()
      .filter_map(|id| {
        self.callbacks.remove(&id).map(|callback| {
          debug!(request_id = %id, "request expired");
          Resolved {
            request_id: id,
            outcome: Outcome::Timeout,
            continuation: callback.continuation,
          }
        })
      })
      .collect()
  }

  #[cfg(test)]
  pub(crate) fn set_last_id(&mut self, last_id: u32) {
    self.last_id = last_id;
  }
}

/// Whether a ping outcome is a valid pong.
pub fn is_pong(outcome: &Outcome) -> bool {
  match outcome {
    Outcome::Ok { status: 200, body } => serde_json::from_slice::<ApiMessage>(body)
      .map(|msg| msg.text == "pong")
      .unwrap_or(false),
    _ => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::RecordingNetwork;
  use serde_json::json;

  fn transport() -> (Transport<&'static str>, RecordingNetwork) {
    let network = RecordingNetwork::default();
    let transport = Transport::new(Box::new(network.clone()), DEFAULT_EXPIRE_AFTER);
    (transport, network)
  }

  fn ok(body: &str) -> Outcome {
    Outcome::Ok {
      status: 200,
      body: body.as_bytes().to_vec(),
    }
  }

  #[test]
  fn test_ids_are_positive_and_increasing() {
    let (mut transport, network) = transport();
    let a = transport.send("/banks", None, "a");
    let b = transport.send("/towns", None, "b");
    assert_eq!(a.get(), 1);
    assert_eq!(b.get(), 2);
    assert_eq!(network.len(), 2);
    assert_eq!(transport.in_flight(), 2);
  }

  #[test]
  fn test_id_wraps_to_one() {
    let (mut transport, _network) = transport();
    transport.set_last_id(u32::MAX - 1);
    assert_eq!(transport.send("/a", None, "a").get(), u32::MAX);
    assert_eq!(transport.send("/b", None, "b").get(), 1);
  }

  #[test]
  fn test_wrapped_id_skips_live_request() {
    let (mut transport, _network) = transport();
    let first = transport.send("/a", None, "a");
    transport.set_last_id(u32::MAX);
    let next = transport.send("/b", None, "b");
    assert_eq!(first.get(), 1);
    assert_eq!(next.get(), 2);
  }

  #[test]
  fn test_get_and_post_dispatch() {
    let (mut transport, network) = transport();
    transport.send("/towns", None, "ids");
    transport.send("/towns", Some(json!({ "towns": [1, 2] })), "batch");
    let sent = network.take();
    assert_eq!(sent[0].path, "/towns");
    assert!(sent[0].body.is_none());
    assert_eq!(sent[1].body, Some(json!({ "towns": [1, 2] })));
  }

  #[test]
  fn test_result_resolves_exactly_once() {
    let (mut transport, _network) = transport();
    let id = transport.send("/banks", None, "cont");

    let resolved = transport.on_result(id, ok("{}")).unwrap();
    assert_eq!(resolved.continuation, "cont");
    assert!(resolved.outcome.is_success());

    assert!(transport.on_result(id, ok("{}")).is_none());
    assert_eq!(transport.in_flight(), 0);
  }

  #[test]
  fn test_stray_response_is_ignored() {
    let (mut transport, _network) = transport();
    let stray = RequestId::from_raw(42).unwrap();
    assert!(transport.on_result(stray, ok("{}")).is_none());
  }

  #[test]
  fn test_expiry_window_boundary() {
    let (mut transport, _network) = transport();
    let start = Instant::now();
    transport.send_at("/banks", None, "cont", start);

    assert!(transport
      .expire_stale_at(start + DEFAULT_EXPIRE_AFTER)
      .is_empty());

    let expired = transport.expire_stale_at(start + DEFAULT_EXPIRE_AFTER + Duration::from_millis(1));
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].outcome, Outcome::Timeout);
    assert_eq!(expired[0].continuation, "cont");
  }

  #[test]
  fn test_expiry_is_idempotent_and_late_response_is_noop() {
    let (mut transport, _network) = transport();
    let start = Instant::now();
    let id = transport.send_at("/banks", None, "cont", start);
    let later = start + Duration::from_secs(5);

    assert_eq!(transport.expire_stale_at(later).len(), 1);
    assert!(transport.expire_stale_at(later).is_empty());
    assert!(transport.on_result(id, ok("{}")).is_none());
  }

  #[test]
  fn test_expiry_only_touches_old_requests() {
    let (mut transport, _network) = transport();
    let start = Instant::now();
    let old = transport.send_at("/old", None, "old", start);
    let young = transport.send_at("/young", None, "young", start + Duration::from_millis(900));

    let expired = transport.expire_stale_at(start + Duration::from_millis(1500));
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].request_id, old);
    assert!(transport.is_pending(young));
  }

  #[test]
  fn test_transport_error_kinds_are_distinct_from_status() {
    let refused = Outcome::TransportError(TransportErrorKind::ConnectionRefused);
    let not_found = Outcome::Ok {
      status: 404,
      body: Vec::new(),
    };
    assert!(!refused.is_success());
    assert!(!not_found.is_success());
    assert_ne!(
      TransportErrorKind::HostNotFound.message(),
      TransportErrorKind::Unknown.message()
    );
  }

  #[test]
  fn test_pong() {
    assert!(is_pong(&ok(r#"{"text":"pong"}"#)));
    assert!(!is_pong(&ok(r#"{"text":"ping"}"#)));
    assert!(!is_pong(&ok("garbage")));
    assert!(!is_pong(&Outcome::Timeout));
    assert!(!is_pong(&Outcome::Ok {
      status: 500,
      body: br#"{"text":"pong"}"#.to_vec()
    }));
  }

  #[test]
  fn test_ping_uses_health_path() {
    let (mut transport, network) = transport();
    transport.ping("ping");
    assert_eq!(network.take()[0].path, PING_PATH);
  }
}
