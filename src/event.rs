use std::time::Duration;
use tokio::sync::mpsc;

use crate::api::transport::{Outcome, RequestId};
use crate::api::types::EntityKind;
use crate::request::{RequestHandle, RequestKind};

/// Engine events
#[derive(Debug)]
pub enum Event {
  /// Periodic tick driving the expiry sweep
  Tick,
  /// A network task finished
  Response { id: RequestId, outcome: Outcome },
  Command(Command),
}

/// Requests from the UI layer
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
  Refresh(EntityKind),
  Ping,
  Submit { kind: RequestKind, json: String },
  Abort(RequestHandle),
  /// Run an idle request again from `step` with a full budget
  Restart { handle: RequestHandle, step: usize },
  Dispose(RequestHandle),
  Shutdown,
}

/// Single queue every engine input goes through
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler ticking every `sweep`
  pub fn new(sweep: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    let tick_tx = tx.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(sweep);
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        interval.tick().await;
        if tick_tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    Self { tx, rx }
  }

  /// Sender for network tasks and commands
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_ticks_and_commands_share_the_queue() {
    let mut events = EventHandler::new(Duration::from_millis(10));
    events
      .sender()
      .send(Event::Command(Command::Ping))
      .unwrap();

    let mut saw_tick = false;
    let mut saw_ping = false;
    while !(saw_tick && saw_ping) {
      match events.next().await {
        Some(Event::Tick) => saw_tick = true,
        Some(Event::Command(Command::Ping)) => saw_ping = true,
        other => panic!("unexpected event {:?}", other),
      }
    }
  }
}
