use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::task::{Priority, TaskDocument, TaskMetadata, TaskStatus, TaskType, Team};

/// Consumer callback. Returning an error converts the task into a
/// retry-or-terminal-failure outcome; it never reaches the engine's own
/// control flow.
#[async_trait]
pub trait TaskHandler: Send + Sync {
  async fn handle(&self, task: &TaskDocument) -> anyhow::Result<()>;
}

/// Structural filter applied before a subscriber is invoked. Empty fields
/// are wildcards; `tags` matches on any overlap.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
  pub status: Vec<TaskStatus>,
  pub priority: Vec<Priority>,
  pub task_type: Vec<TaskType>,
  pub from: Vec<Team>,
  pub to: Vec<Team>,
  pub tags: Vec<String>,
  pub created_after: Option<DateTime<Utc>>,
  pub created_before: Option<DateTime<Utc>>,
}

impl TaskFilter {
  pub fn matches(&self, metadata: &TaskMetadata) -> bool {
    if !self.status.is_empty() && !self.status.contains(&metadata.status) {
      return false;
    }
    if !self.priority.is_empty() && !self.priority.contains(&metadata.priority) {
      return false;
    }
    if !self.task_type.is_empty() && !self.task_type.contains(&metadata.task_type) {
      return false;
    }
    if !self.from.is_empty() && !self.from.contains(&metadata.from) {
      return false;
    }
    if !self.to.is_empty() && !self.to.contains(&metadata.to) {
      return false;
    }
    if !self.tags.is_empty() && !self.tags.iter().any(|t| metadata.tags.contains(t)) {
      return false;
    }
    if let Some(after) = self.created_after
      && metadata.created_at < after
    {
      return false;
    }
    if let Some(before) = self.created_before
      && metadata.created_at > before
    {
      return false;
    }
    true
  }
}

/// How a team's inbox is observed for new files: a filesystem watch, or
/// polling at a fixed interval. Selecting `Watch` still falls back to
/// polling when the watch cannot be established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
  Watch,
  Poll(Duration),
}

impl Default for DeliveryMode {
  fn default() -> Self {
    Self::Watch
  }
}

#[derive(Clone, Default)]
pub struct SubscribeOptions {
  pub filter: TaskFilter,
  /// Acknowledge as completed immediately after all callbacks succeed.
  pub auto_acknowledge: bool,
  pub delivery: DeliveryMode,
}

/// One registered callback for a team.
#[derive(Clone)]
pub(crate) struct Subscriber {
  pub id: u64,
  pub handler: Arc<dyn TaskHandler>,
  pub options: SubscribeOptions,
}

/// Returned by `subscribe`; pass back to `unsubscribe` to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle {
  pub(crate) team: Team,
  pub(crate) id: u64,
}

impl SubscriptionHandle {
  pub fn team(&self) -> Team {
    self.team
  }
}
