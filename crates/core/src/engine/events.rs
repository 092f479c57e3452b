use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::domain::task::{Priority, Team};

/// Operational signal emitted by the queue engine. Events are advisory:
/// dropping or missing one never changes queue behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
  pub timestamp: DateTime<Utc>,
  #[serde(flatten)]
  pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
  Published {
    task_id: String,
    to: Team,
    priority: Priority,
  },
  Received {
    task_id: String,
    team: Team,
  },
  Started {
    task_id: String,
    team: Team,
  },
  Completed {
    task_id: String,
    team: Team,
  },
  Failed {
    task_id: String,
    team: Team,
    error: String,
  },
  Retry {
    task_id: String,
    team: Team,
    attempt: u32,
  },
  Error {
    message: String,
    path: Option<PathBuf>,
  },
}

/// Broadcast fan-out for queue events. A send error only means nobody is
/// listening and is discarded.
#[derive(Debug, Clone)]
pub(crate) struct EventBus {
  tx: broadcast::Sender<QueueEvent>,
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity);
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
    self.tx.subscribe()
  }

  pub fn emit(&self, kind: EventKind) {
    let _ = self.tx.send(QueueEvent {
      timestamp: Utc::now(),
      kind,
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn events_reach_subscribers() {
    let bus = EventBus::new(16);
    let mut rx = bus.subscribe();
    bus.emit(EventKind::Received {
      task_id: "abc".into(),
      team: Team::Qa,
    });
    let event = rx.recv().await.expect("event");
    assert!(matches!(event.kind, EventKind::Received { ref task_id, team: Team::Qa } if task_id == "abc"));
  }

  #[test]
  fn emitting_without_receivers_is_fine() {
    let bus = EventBus::new(4);
    bus.emit(EventKind::Error {
      message: "nothing listening".into(),
      path: None,
    });
  }
}
