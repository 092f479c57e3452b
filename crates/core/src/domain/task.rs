use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Default retry budget for newly created tasks.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
  Feature,
  Bugfix,
  Refactor,
  Test,
  Review,
  Documentation,
  Infrastructure,
  Analysis,
  Planning,
  Design,
}

impl TaskType {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Feature => "feature",
      Self::Bugfix => "bugfix",
      Self::Refactor => "refactor",
      Self::Test => "test",
      Self::Review => "review",
      Self::Documentation => "documentation",
      Self::Infrastructure => "infrastructure",
      Self::Analysis => "analysis",
      Self::Planning => "planning",
      Self::Design => "design",
    }
  }
}

impl fmt::Display for TaskType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A named producer/consumer with its own inbox directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Team {
  Orchestrator,
  Planning,
  Development,
  Qa,
  Devops,
  Documentation,
}

impl Team {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Orchestrator => "orchestrator",
      Self::Planning => "planning",
      Self::Development => "development",
      Self::Qa => "qa",
      Self::Devops => "devops",
      Self::Documentation => "documentation",
    }
  }

  /// Every known team, used when laying out the workspace inboxes.
  pub fn all() -> Vec<Team> {
    vec![
      Self::Orchestrator,
      Self::Planning,
      Self::Development,
      Self::Qa,
      Self::Devops,
      Self::Documentation,
    ]
  }
}

impl fmt::Display for Team {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Dispatch priority. Embedded in filenames so the engine can sort a
/// backlog without opening documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
  Critical,
  High,
  #[default]
  Medium,
  Low,
}

impl Priority {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Critical => "critical",
      Self::High => "high",
      Self::Medium => "medium",
      Self::Low => "low",
    }
  }

  /// Lower rank dispatches first.
  pub fn rank(&self) -> u8 {
    match self {
      Self::Critical => 0,
      Self::High => 1,
      Self::Medium => 2,
      Self::Low => 3,
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "critical" => Some(Self::Critical),
      "high" => Some(Self::High),
      "medium" => Some(Self::Medium),
      "low" => Some(Self::Low),
      _ => None,
    }
  }
}

impl fmt::Display for Priority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
  #[default]
  Pending,
  InProgress,
  Blocked,
  Completed,
  Failed,
  Cancelled,
}

impl TaskStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::InProgress => "in_progress",
      Self::Blocked => "blocked",
      Self::Completed => "completed",
      Self::Failed => "failed",
      Self::Cancelled => "cancelled",
    }
  }

  /// Statuses that stamp `completed_at`. `cancelled` is assigned
  /// externally, never by the engine, and does not count.
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Completed | Self::Failed)
  }
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyRelation {
  Blocks,
  BlockedBy,
  Related,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDependency {
  pub task_id: String,
  pub relation: DependencyRelation,
  /// Cached status of the referenced task, refreshed by whoever owns it.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<TaskStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
  Create,
  Modify,
  Delete,
  Review,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFileRef {
  pub path: String,
  pub action: FileAction,
}

/// Structured metadata carried in the frontmatter of every task document.
/// Key names mirror the on-disk format exactly (camelCase, `type` for the
/// task type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
  pub id: String,
  pub title: String,
  #[serde(rename = "type")]
  pub task_type: TaskType,
  pub from: Team,
  pub to: Team,
  #[serde(default)]
  pub priority: Priority,
  #[serde(default)]
  pub status: TaskStatus,
  pub created_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub updated_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub completed_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub parent_task_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub project_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub issue_id: Option<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub dependencies: Vec<TaskDependency>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub files: Vec<TaskFileRef>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub quality_metrics: Option<serde_yaml::Value>,
  #[serde(default)]
  pub retry_count: u32,
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub tags: Vec<String>,
  /// Frontmatter keys outside the schema survive a rewrite untouched.
  #[serde(flatten)]
  pub extra: BTreeMap<String, serde_yaml::Value>,
}

fn default_max_retries() -> u32 {
  DEFAULT_MAX_RETRIES
}

/// The unit of work exchanged between teams: structured metadata plus a
/// free-form markdown body.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDocument {
  pub metadata: TaskMetadata,
  pub content: String,
}

#[derive(Debug, Error)]
pub enum TaskError {
  #[error("task title must not be empty")]
  EmptyTitle,
}

/// Input for creating a task. Required fields are part of the constructor;
/// everything else defaults.
#[derive(Debug, Clone)]
pub struct NewTask {
  pub title: String,
  pub task_type: TaskType,
  pub from: Team,
  pub to: Team,
  pub priority: Option<Priority>,
  pub content: String,
  pub parent_task_id: Option<String>,
  pub project_id: Option<String>,
  pub issue_id: Option<String>,
  pub dependencies: Vec<TaskDependency>,
  pub files: Vec<TaskFileRef>,
  pub max_retries: Option<u32>,
  pub tags: Vec<String>,
}

impl NewTask {
  pub fn new(title: impl Into<String>, task_type: TaskType, from: Team, to: Team) -> Self {
    Self {
      title: title.into(),
      task_type,
      from,
      to,
      priority: None,
      content: String::new(),
      parent_task_id: None,
      project_id: None,
      issue_id: None,
      dependencies: Vec::new(),
      files: Vec::new(),
      max_retries: None,
      tags: Vec::new(),
    }
  }
}

/// Unique, non-sortable task id: hex millisecond timestamp plus a random
/// suffix. Embedded verbatim in the task filename.
pub fn generate_task_id() -> String {
  let millis = Utc::now().timestamp_millis().max(0);
  let suffix = Uuid::new_v4().simple().to_string();
  format!("{millis:x}-{}", &suffix[..8])
}

impl TaskDocument {
  /// Create a new task document with defaults filled in.
  pub fn create(input: NewTask) -> Result<Self, TaskError> {
    if input.title.trim().is_empty() {
      return Err(TaskError::EmptyTitle);
    }
    let now = Utc::now();
    Ok(Self {
      metadata: TaskMetadata {
        id: generate_task_id(),
        title: input.title,
        task_type: input.task_type,
        from: input.from,
        to: input.to,
        priority: input.priority.unwrap_or_default(),
        status: TaskStatus::Pending,
        created_at: now,
        updated_at: None,
        completed_at: None,
        parent_task_id: input.parent_task_id,
        project_id: input.project_id,
        issue_id: input.issue_id,
        dependencies: input.dependencies,
        files: input.files,
        quality_metrics: None,
        retry_count: 0,
        max_retries: input.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        tags: input.tags,
        extra: BTreeMap::new(),
      },
      content: input.content.trim().to_string(),
    })
  }

  /// Return a copy with the new status. Stamps `updated_at`, and
  /// `completed_at` iff the status is terminal (otherwise the previous
  /// value is carried forward).
  pub fn update_status(&self, status: TaskStatus) -> Self {
    let now = Utc::now();
    let mut doc = self.clone();
    doc.metadata.status = status;
    doc.metadata.updated_at = Some(now);
    if status.is_terminal() {
      doc.metadata.completed_at = Some(now);
    }
    doc
  }

  /// Return a copy with the retry counter bumped and `updated_at` stamped.
  pub fn increment_retry(&self) -> Self {
    let mut doc = self.clone();
    doc.metadata.retry_count += 1;
    doc.metadata.updated_at = Some(Utc::now());
    doc
  }

  pub fn can_retry(&self) -> bool {
    self.metadata.retry_count < self.metadata.max_retries
  }

  /// True iff any `blocked_by` dependency lacks a cached completed status.
  pub fn has_unmet_dependencies(&self) -> bool {
    self.metadata.dependencies.iter().any(|dep| {
      dep.relation == DependencyRelation::BlockedBy && dep.status != Some(TaskStatus::Completed)
    })
  }
}
