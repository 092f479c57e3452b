use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

pub mod events;
pub mod subscription;
mod watcher;

pub use events::{EventKind, QueueEvent};
pub use subscription::{
  DeliveryMode, SubscribeOptions, SubscriptionHandle, TaskFilter, TaskHandler,
};
use crate::adapters::fs::{FileInfo, FileSystem, TokioFs};
use crate::config::Config;
use crate::domain::document::{
  ParseError, SerializeError, extract_task_id, from_markdown, priority_from_filename,
  task_filename, to_markdown,
};
use crate::domain::task::{NewTask, TaskDocument, TaskError, TaskStatus, Team};
use crate::store::{Stage, WorkspaceStats, WorkspaceStore};
use events::EventBus;
use subscription::Subscriber;
use watcher::DrainDriver;

/// Backlog files processed concurrently within one drain batch.
const DRAIN_BATCH: usize = 5;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum QueueError {
  #[error(transparent)]
  Task(#[from] TaskError),
  #[error(transparent)]
  Parse(#[from] ParseError),
  #[error(transparent)]
  Serialize(#[from] SerializeError),
  #[error("io error: {0}")]
  Io(#[from] io::Error),
  #[error("task not found: {0}")]
  NotFound(String),
  #[error("acknowledge requires a terminal status, got {0}")]
  NotTerminal(TaskStatus),
  #[error("queue engine is stopped")]
  Stopped,
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Default)]
struct TeamState {
  subscribers: Vec<Subscriber>,
  driver: Option<DrainDriver>,
}

/// A task that has been claimed and moved to in-progress but whose
/// subscribers have not run yet. `index` is its position in the drain
/// order of the batch that staged it.
struct StagedTask {
  index: usize,
  task_id: String,
  doc: TaskDocument,
  path: PathBuf,
  subscribers: Vec<Subscriber>,
}

struct Inner {
  store: WorkspaceStore,
  events: EventBus,
  running: AtomicBool,
  /// Applied to published tasks that carry no explicit retry budget.
  default_max_retries: u32,
  /// Fallback cadence when a watch cannot be established.
  poll_interval: Duration,
  next_subscriber_id: AtomicU64,
  /// Task ids currently being processed. Guards against duplicate
  /// filesystem events dispatching the same file twice.
  in_flight: Mutex<HashSet<String>>,
  /// Inbox file names already reported as not matching the task pattern,
  /// so every drain pass does not repeat the warning.
  unrecognized: Mutex<HashSet<String>>,
  teams: RwLock<HashMap<Team, TeamState>>,
}

/// The queue engine: publish/subscribe/acknowledge over a workspace
/// directory tree. Cheap to clone; all clones share one engine.
#[derive(Clone)]
pub struct QueueEngine {
  inner: Arc<Inner>,
}

impl QueueEngine {
  pub fn new(config: &Config) -> Self {
    Self::with_fs(config, Arc::new(TokioFs))
  }

  pub fn with_fs(config: &Config, fs: Arc<dyn FileSystem>) -> Self {
    let store = WorkspaceStore::new(fs, config.root.clone(), config.teams.clone());
    Self {
      inner: Arc::new(Inner {
        store,
        events: EventBus::new(EVENT_CAPACITY),
        running: AtomicBool::new(false),
        default_max_retries: config.default_max_retries,
        poll_interval: config.poll_interval(),
        next_subscriber_id: AtomicU64::new(1),
        in_flight: Mutex::new(HashSet::new()),
        unrecognized: Mutex::new(HashSet::new()),
        teams: RwLock::new(HashMap::new()),
      }),
    }
  }

  pub fn store(&self) -> &WorkspaceStore {
    &self.inner.store
  }

  /// Receiver for the engine's event stream.
  pub fn events(&self) -> broadcast::Receiver<QueueEvent> {
    self.inner.events.subscribe()
  }

  pub fn is_running(&self) -> bool {
    self.inner.running.load(Ordering::SeqCst)
  }

  /// Initialize the workspace and accept subscriptions. Idempotent.
  pub async fn start(&self) -> Result<()> {
    self.inner.store.ensure_initialized().await?;
    self.inner.running.store(true, Ordering::SeqCst);
    info!(event = "engine_started", root = %self.inner.store.root().display(), "queue engine started");
    Ok(())
  }

  /// Wind down every watcher and polling timer and clear subscriptions.
  /// Idempotent. A subscriber callback that already started runs to
  /// completion before this returns; staged tasks whose callbacks have not
  /// started go back to their inbox.
  pub async fn stop(&self) {
    self.inner.running.store(false, Ordering::SeqCst);
    let drivers: Vec<DrainDriver> = {
      let mut teams = self.inner.teams.write().await;
      teams.drain().filter_map(|(_, state)| state.driver).collect()
    };
    for driver in drivers {
      driver.shutdown().await;
    }
    info!(event = "engine_stopped", "queue engine stopped");
  }

  /// Build a task document, serialize it, and drop it into the destination
  /// team's inbox.
  pub async fn publish(&self, mut input: NewTask) -> Result<TaskDocument> {
    self.inner.store.ensure_initialized().await?;
    input.max_retries.get_or_insert(self.inner.default_max_retries);
    let doc = TaskDocument::create(input)?;
    let text = to_markdown(&doc)?;
    let path = self
      .inner
      .store
      .inbox_dir(doc.metadata.to)
      .join(task_filename(&doc));
    self.inner.store.write_file(&path, &text).await?;
    info!(
      event = "task_published",
      task_id = %doc.metadata.id,
      to = %doc.metadata.to,
      priority = %doc.metadata.priority,
      "task published"
    );
    self.inner.events.emit(EventKind::Published {
      task_id: doc.metadata.id.clone(),
      to: doc.metadata.to,
      priority: doc.metadata.priority,
    });
    Ok(doc)
  }

  /// Register a callback for `team`. Any backlog already sitting in the
  /// inbox is drained immediately, then the inbox is observed per
  /// `options.delivery`.
  pub async fn subscribe(
    &self,
    team: Team,
    handler: Arc<dyn TaskHandler>,
    options: SubscribeOptions,
  ) -> Result<SubscriptionHandle> {
    if !self.is_running() {
      return Err(QueueError::Stopped);
    }
    self.inner.store.ensure_initialized().await?;
    let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
    let delivery = options.delivery;
    {
      let mut teams = self.inner.teams.write().await;
      let state = teams.entry(team).or_default();
      state.subscribers.push(Subscriber {
        id,
        handler,
        options,
      });
      if state.driver.is_none() {
        state.driver = Some(watcher::arm(
          self.clone(),
          team,
          delivery,
          self.inner.poll_interval,
        ));
      }
    }
    info!(event = "subscribed", team = %team, subscriber_id = id, "subscriber registered");
    self.drain(team).await;
    Ok(SubscriptionHandle { team, id })
  }

  /// Deregister one callback. Tearing down the last callback for a team
  /// also winds down that team's watcher/poller, waiting for any drain it
  /// is in the middle of.
  pub async fn unsubscribe(&self, handle: SubscriptionHandle) {
    let driver = {
      let mut teams = self.inner.teams.write().await;
      let Some(state) = teams.get_mut(&handle.team) else {
        return;
      };
      state.subscribers.retain(|s| s.id != handle.id);
      if state.subscribers.is_empty() {
        let driver = state.driver.take();
        teams.remove(&handle.team);
        driver
      } else {
        None
      }
    };
    if let Some(driver) = driver {
      driver.shutdown().await;
    }
    info!(event = "unsubscribed", team = %handle.team, subscriber_id = handle.id, "subscriber removed");
  }

  /// One pass over a team's inbox: list, order by priority then age, then
  /// per batch stage every file concurrently and dispatch callbacks
  /// sequentially in that order. Ordering is recomputed from scratch every
  /// pass.
  pub(crate) async fn drain(&self, team: Team) {
    if !self.is_running() {
      return;
    }
    let inbox = self.inner.store.inbox_dir(team);
    let files = match self.inner.store.list_files(&inbox, None).await {
      Ok(files) => files,
      Err(e) => {
        self.report_error(format!("listing inbox for {team}: {e}"), Some(inbox));
        return;
      }
    };
    let mut queue: Vec<(u8, FileInfo)> = Vec::new();
    for file in files {
      match priority_from_filename(&file.name).filter(|_| extract_task_id(&file.name).is_some()) {
        Some(priority) => queue.push((priority.rank(), file)),
        None => self.note_unrecognized(&file).await,
      }
    }
    // list_files is oldest-first; a stable sort on rank keeps that as the
    // FIFO tiebreak within each priority.
    queue.sort_by_key(|(rank, _)| *rank);
    let files: Vec<FileInfo> = queue.into_iter().map(|(_, file)| file).collect();

    for chunk in files.chunks(DRAIN_BATCH) {
      let mut batch = JoinSet::new();
      for (index, file) in chunk.iter().enumerate() {
        let engine = self.clone();
        let path = file.path.clone();
        batch.spawn(async move { engine.stage_file(team, index, path).await });
      }
      let mut staged = Vec::new();
      while let Some(joined) = batch.join_next().await {
        if let Ok(Some(task)) = joined {
          staged.push(task);
        }
      }
      staged.sort_by_key(|s| s.index);
      for task in staged {
        self.dispatch(team, task).await;
      }
    }
  }

  /// Claim a file's task id and move it to in-progress. Returns None when
  /// the file is not a task, is already in flight, or vanished in a race.
  /// On Some, the claim is held until [`Self::dispatch`] releases it.
  async fn stage_file(&self, team: Team, index: usize, path: PathBuf) -> Option<StagedTask> {
    if !self.is_running() {
      return None;
    }
    let name = path.file_name().and_then(|n| n.to_str())?;
    let task_id = extract_task_id(name)?;
    if !self.claim(&task_id).await {
      return None;
    }
    match self.stage_claimed(team, index, &path, &task_id).await {
      Some(staged) => Some(staged),
      None => {
        self.release(&task_id).await;
        None
      }
    }
  }

  async fn stage_claimed(
    &self,
    team: Team,
    index: usize,
    path: &Path,
    task_id: &str,
  ) -> Option<StagedTask> {
    let store = &self.inner.store;
    let text = match store.read_file(path).await {
      Ok(text) => text,
      // Lost the race against another drain pass; the file is already
      // elsewhere. Not an error.
      Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
      Err(e) => {
        self.report_error(format!("reading {}: {e}", path.display()), Some(path.to_path_buf()));
        return None;
      }
    };
    let doc = match from_markdown(&text, Some(path)) {
      Ok(doc) => doc,
      Err(e) => {
        warn!(event = "task_unparsable", path = %path.display(), error = %e, "corrupt task file left in place");
        self.report_error(e.to_string(), Some(path.to_path_buf()));
        return None;
      }
    };

    let subscribers = self.matching_subscribers(team, &doc).await;
    if subscribers.is_empty() {
      // No registered callback wants it; it stays queued.
      return None;
    }

    let in_progress = match store.move_file(path, &store.stage_dir(Stage::InProgress)).await {
      Ok(p) => p,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
      Err(e) => {
        self.report_error(format!("moving {}: {e}", path.display()), Some(path.to_path_buf()));
        return None;
      }
    };

    let doc = doc.update_status(TaskStatus::InProgress);
    if let Err(e) = self.rewrite(&doc, &in_progress).await {
      self.report_error(
        format!("rewriting {}: {e}", in_progress.display()),
        Some(in_progress.clone()),
      );
    }
    self.inner.events.emit(EventKind::Received {
      task_id: task_id.to_string(),
      team,
    });
    Some(StagedTask {
      index,
      task_id: task_id.to_string(),
      doc,
      path: in_progress,
      subscribers,
    })
  }

  /// Run the subscribers for one staged task, awaiting each to completion,
  /// then acknowledge or fail. Releases the in-flight claim.
  async fn dispatch(&self, team: Team, staged: StagedTask) {
    let StagedTask {
      task_id,
      doc,
      path,
      subscribers,
      ..
    } = staged;
    if !self.is_running() {
      // Stopped after staging but before any callback started: undo the
      // staging so nothing is stranded in in-progress.
      self.return_to_inbox(doc, &path).await;
      self.release(&task_id).await;
      return;
    }
    self.inner.events.emit(EventKind::Started {
      task_id: task_id.clone(),
      team,
    });
    info!(event = "task_started", task_id = %task_id, team = %team, "task dispatched");

    let mut failure = None;
    let mut auto_acknowledge = false;
    for subscriber in &subscribers {
      auto_acknowledge |= subscriber.options.auto_acknowledge;
      if let Err(e) = subscriber.handler.handle(&doc).await {
        failure = Some(format!("{e:#}"));
        break;
      }
    }

    match failure {
      Some(error) => self.handle_task_failure(team, doc, &path, error).await,
      None if auto_acknowledge => {
        if let Err(e) = self.retire(team, doc, &path, TaskStatus::Completed, None).await {
          self.report_error(format!("acknowledging {task_id}: {e}"), Some(path.clone()));
        }
      }
      // Without auto-acknowledge the file stays in in-progress until the
      // caller acknowledges explicitly.
      None => {}
    }
    self.release(&task_id).await;
  }

  /// Move a staged file back to its team inbox and restore pending status.
  async fn return_to_inbox(&self, doc: TaskDocument, path: &Path) {
    let store = &self.inner.store;
    let doc = doc.update_status(TaskStatus::Pending);
    match store.move_file(path, &store.inbox_dir(doc.metadata.to)).await {
      Ok(dest) => {
        if let Err(e) = self.rewrite(&doc, &dest).await {
          self.report_error(format!("requeuing {}: {e}", doc.metadata.id), Some(dest));
        }
      }
      Err(e) if e.kind() == io::ErrorKind::NotFound => {}
      Err(e) => {
        self.report_error(
          format!("requeuing {}: {e}", doc.metadata.id),
          Some(path.to_path_buf()),
        );
      }
    }
  }

  /// Retry-or-fail outcome for a task whose callback errored. The retry
  /// policy lives entirely in the document's own fields and the file's
  /// placement.
  async fn handle_task_failure(&self, team: Team, doc: TaskDocument, path: &Path, error: String) {
    let store = &self.inner.store;
    let task_id = doc.metadata.id.clone();
    if doc.can_retry() {
      let retried = doc.increment_retry().update_status(TaskStatus::Pending);
      let attempt = retried.metadata.retry_count;
      let text = match to_markdown(&retried) {
        Ok(text) => text,
        Err(e) => {
          self.report_error(format!("serializing retry of {task_id}: {e}"), None);
          return;
        }
      };
      let inbox_path = store
        .inbox_dir(retried.metadata.to)
        .join(task_filename(&retried));
      if let Err(e) = store.write_file(&inbox_path, &text).await {
        self.report_error(format!("requeuing {task_id}: {e}"), Some(inbox_path));
        return;
      }
      if let Err(e) = store.delete_file(path).await
        && e.kind() != io::ErrorKind::NotFound
      {
        self.report_error(
          format!("removing stale in-progress file for {task_id}: {e}"),
          Some(path.to_path_buf()),
        );
      }
      warn!(
        event = "task_retry",
        task_id = %task_id,
        team = %team,
        attempt,
        error = %error,
        "task requeued after failure"
      );
      self.inner.events.emit(EventKind::Retry {
        task_id,
        team,
        attempt,
      });
    } else {
      let failed = doc.update_status(TaskStatus::Failed);
      if let Err(e) = self.rewrite(&failed, path).await {
        self.report_error(format!("marking {task_id} failed: {e}"), Some(path.to_path_buf()));
      }
      if let Err(e) = store.move_file(path, &store.stage_dir(Stage::Failed)).await {
        if e.kind() != io::ErrorKind::NotFound {
          self.report_error(format!("moving {task_id} to failed: {e}"), Some(path.to_path_buf()));
        }
        return;
      }
      error!(
        event = "task_failed",
        task_id = %task_id,
        team = %team,
        error = %error,
        "retries exhausted"
      );
      self.inner.events.emit(EventKind::Failed {
        task_id,
        team,
        error,
      });
    }
  }

  /// Explicit completion path for consumers not using auto-acknowledge.
  /// Locates the task's file in in-progress by its exact id segment.
  pub async fn acknowledge(
    &self,
    task_id: &str,
    status: TaskStatus,
    result: Option<&str>,
  ) -> Result<TaskDocument> {
    if !status.is_terminal() {
      return Err(QueueError::NotTerminal(status));
    }
    let store = &self.inner.store;
    let dir = store.stage_dir(Stage::InProgress);
    let files = store.list_files(&dir, None).await?;
    let file = files
      .iter()
      .find(|f| extract_task_id(&f.name).as_deref() == Some(task_id))
      .ok_or_else(|| QueueError::NotFound(task_id.to_string()))?;
    let text = store.read_file(&file.path).await?;
    let doc = from_markdown(&text, Some(&file.path))?;
    let team = doc.metadata.to;
    let doc = self.retire(team, doc.update_status(status), &file.path, status, result).await?;
    Ok(doc)
  }

  /// Write the final status (and optional result section) and move the
  /// file out of in-progress.
  async fn retire(
    &self,
    team: Team,
    doc: TaskDocument,
    path: &Path,
    status: TaskStatus,
    result: Option<&str>,
  ) -> Result<TaskDocument> {
    let store = &self.inner.store;
    let mut doc = if doc.metadata.status == status {
      doc
    } else {
      doc.update_status(status)
    };
    if let Some(result) = result {
      if !doc.content.is_empty() {
        doc.content.push_str("\n\n");
      }
      doc.content.push_str("## Result\n\n");
      doc.content.push_str(result.trim());
    }
    store.write_file(path, &to_markdown(&doc)?).await?;
    let dest = if status == TaskStatus::Completed {
      Stage::Outbox
    } else {
      Stage::Failed
    };
    store.move_file(path, &store.stage_dir(dest)).await?;
    let task_id = doc.metadata.id.clone();
    info!(event = "task_retired", task_id = %task_id, team = %team, status = %status, "task retired");
    match status {
      TaskStatus::Completed => self.inner.events.emit(EventKind::Completed { task_id, team }),
      _ => self.inner.events.emit(EventKind::Failed {
        task_id,
        team,
        error: "acknowledged as failed".to_string(),
      }),
    }
    Ok(doc)
  }

  /// Look a task up by id across in-progress, outbox, failed, and archive.
  pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskDocument>> {
    let store = &self.inner.store;
    for stage in [Stage::InProgress, Stage::Outbox, Stage::Failed, Stage::Archive] {
      let files = store.list_files(&store.stage_dir(stage), None).await?;
      if let Some(file) = files
        .iter()
        .find(|f| extract_task_id(&f.name).as_deref() == Some(task_id))
      {
        let text = store.read_file(&file.path).await?;
        return Ok(Some(from_markdown(&text, Some(&file.path))?));
      }
    }
    Ok(None)
  }

  /// All tasks across in-progress, outbox, and failed matching the filter.
  /// Unparsable files are skipped, never fatal.
  pub async fn get_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskDocument>> {
    let store = &self.inner.store;
    let mut tasks = Vec::new();
    for stage in [Stage::InProgress, Stage::Outbox, Stage::Failed] {
      for file in store.list_files(&store.stage_dir(stage), None).await? {
        let Ok(text) = store.read_file(&file.path).await else {
          continue;
        };
        match from_markdown(&text, Some(&file.path)) {
          Ok(doc) if filter.matches(&doc.metadata) => tasks.push(doc),
          Ok(_) => {}
          Err(e) => {
            warn!(event = "task_unparsable", path = %file.path.display(), error = %e, "skipping");
          }
        }
      }
    }
    Ok(tasks)
  }

  pub async fn stats(&self) -> Result<WorkspaceStats> {
    Ok(self.inner.store.stats().await?)
  }

  /// Move outbox and failed files older than `max_age` into the archive.
  pub async fn archive_old_tasks(&self, max_age: Duration) -> Result<usize> {
    let store = &self.inner.store;
    let now = SystemTime::now();
    let archive = store.stage_dir(Stage::Archive);
    let mut moved = 0;
    for stage in [Stage::Outbox, Stage::Failed] {
      for file in store.list_files(&store.stage_dir(stage), None).await? {
        let old_enough = now
          .duration_since(file.created)
          .map(|age| age > max_age)
          .unwrap_or(false);
        if !old_enough {
          continue;
        }
        match store.move_file(&file.path, &archive).await {
          Ok(_) => moved += 1,
          Err(e) if e.kind() == io::ErrorKind::NotFound => {}
          Err(e) => return Err(e.into()),
        }
      }
    }
    Ok(moved)
  }

  /// Delete archived files older than `max_age`.
  pub async fn purge_archive(&self, max_age: Duration) -> Result<usize> {
    let store = &self.inner.store;
    Ok(store.cleanup_old_files(&store.stage_dir(Stage::Archive), max_age).await?)
  }

  async fn matching_subscribers(&self, team: Team, doc: &TaskDocument) -> Vec<Subscriber> {
    let teams = self.inner.teams.read().await;
    teams
      .get(&team)
      .map(|state| {
        state
          .subscribers
          .iter()
          .filter(|s| s.options.filter.matches(&doc.metadata))
          .cloned()
          .collect()
      })
      .unwrap_or_default()
  }

  async fn rewrite(&self, doc: &TaskDocument, path: &Path) -> Result<()> {
    let text = to_markdown(doc)?;
    self.inner.store.write_file(path, &text).await?;
    Ok(())
  }

  /// Report an inbox file whose name does not match the task pattern.
  /// Hand-authored files only get flagged once, then stay put.
  async fn note_unrecognized(&self, file: &FileInfo) {
    let mut seen = self.inner.unrecognized.lock().await;
    if seen.insert(file.name.clone()) {
      warn!(
        event = "unrecognized_task_file",
        path = %file.path.display(),
        "inbox file does not match the task filename pattern; skipping"
      );
      self.inner.events.emit(EventKind::Error {
        message: format!("unrecognized task file name: {}", file.name),
        path: Some(file.path.clone()),
      });
    }
  }

  async fn claim(&self, task_id: &str) -> bool {
    self.inner.in_flight.lock().await.insert(task_id.to_string())
  }

  async fn release(&self, task_id: &str) {
    self.inner.in_flight.lock().await.remove(task_id);
  }

  fn report_error(&self, message: String, path: Option<PathBuf>) {
    error!(event = "queue_error", error = %message, "queue engine error");
    self.inner.events.emit(EventKind::Error { message, path });
  }
}
