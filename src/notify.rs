//! Notifications delivered to the UI layer.

use tokio::sync::mpsc;
use tracing::debug;

use crate::api::transport::RequestId;
use crate::api::types::{EntityId, EntityKind};
use crate::request::{CashPointResponse, RequestHandle};

/// Everything the engine reports outward. Delivery is queued, never nested
/// inside the handler that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
  Progress {
    kind: EntityKind,
    done: usize,
    total: usize,
  },
  SyncError {
    kind: EntityKind,
    request_id: Option<RequestId>,
    message: String,
  },
  IconError {
    kind: EntityKind,
    id: EntityId,
    message: String,
  },
  ServerDataReceived {
    kind: EntityKind,
  },
  Reachability(bool),
  RequestStep {
    handle: RequestHandle,
    step: usize,
    ok: bool,
    message: String,
  },
  RequestData {
    handle: RequestHandle,
    finished: bool,
    response: CashPointResponse,
  },
  RequestError {
    handle: RequestHandle,
    step: usize,
    message: String,
  },
  RequestFinished {
    handle: RequestHandle,
    ok: bool,
  },
}

/// Receiving side of pipeline progress.
pub trait ProgressSink {
  fn on_progress(&self, kind: EntityKind, done: usize, total: usize);
  fn on_error(&self, kind: EntityKind, request_id: Option<RequestId>, message: &str);
  fn on_complete(&self, kind: EntityKind);
  fn on_icon_error(&self, kind: EntityKind, id: EntityId, message: &str);
}

/// Sends notifications over an unbounded channel.
#[derive(Debug, Clone)]
pub struct Notifier {
  tx: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
  pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx }, rx)
  }

  pub fn emit(&self, notification: Notification) {
    if self.tx.send(notification).is_err() {
      debug!("notification receiver dropped");
    }
  }
}

impl ProgressSink for Notifier {
  fn on_progress(&self, kind: EntityKind, done: usize, total: usize) {
    self.emit(Notification::Progress { kind, done, total });
  }

  fn on_error(&self, kind: EntityKind, request_id: Option<RequestId>, message: &str) {
    self.emit(Notification::SyncError {
      kind,
      request_id,
      message: message.to_string(),
    });
  }

  fn on_complete(&self, kind: EntityKind) {
    self.emit(Notification::ServerDataReceived { kind });
  }

  fn on_icon_error(&self, kind: EntityKind, id: EntityId, message: &str) {
    self.emit(Notification::IconError {
      kind,
      id,
      message: message.to_string(),
    });
  }
}
