use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::adapters::fs::{FileInfo, FileSystem, TokioFs};
use courier_core::{
  Config, DeliveryMode, NewTask, Priority, QueueEngine, QueueError, Stage, SubscribeOptions,
  TaskDocument, TaskFilter, TaskHandler, TaskStatus, TaskType, Team,
};
use tokio::sync::Mutex;

use test_support::{TempWorkspace, wait_until};

const WAIT: Duration = Duration::from_secs(5);

fn config(ws: &TempWorkspace) -> Config {
  Config {
    root: ws.workspace(),
    ..Config::default()
  }
}

fn poll_options(auto_acknowledge: bool) -> SubscribeOptions {
  SubscribeOptions {
    auto_acknowledge,
    delivery: DeliveryMode::Poll(Duration::from_millis(50)),
    ..SubscribeOptions::default()
  }
}

/// Records every invocation and fails the first `fail_first` of them.
/// `started` counts entries into the callback; `seen` fills only once the
/// optional delay has elapsed.
#[derive(Default)]
struct Recorder {
  started: AtomicUsize,
  seen: Mutex<Vec<TaskDocument>>,
  fail_first: AtomicUsize,
  delay: Option<Duration>,
}

impl Recorder {
  fn failing(times: usize) -> Self {
    Self {
      fail_first: AtomicUsize::new(times),
      ..Self::default()
    }
  }

  fn started(&self) -> usize {
    self.started.load(Ordering::SeqCst)
  }

  async fn calls(&self) -> usize {
    self.seen.lock().await.len()
  }
}

#[async_trait]
impl TaskHandler for Recorder {
  async fn handle(&self, task: &TaskDocument) -> anyhow::Result<()> {
    self.started.fetch_add(1, Ordering::SeqCst);
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    self.seen.lock().await.push(task.clone());
    if self.fail_first.load(Ordering::SeqCst) > 0 {
      self.fail_first.fetch_sub(1, Ordering::SeqCst);
      anyhow::bail!("induced handler failure");
    }
    Ok(())
  }
}

/// Delegates to the real filesystem but delays reads, widening the window
/// between a drain listing a file and claiming it.
struct SlowReadFs {
  inner: TokioFs,
  delay: Duration,
}

#[async_trait]
impl FileSystem for SlowReadFs {
  async fn read_to_string(&self, path: &Path) -> io::Result<String> {
    tokio::time::sleep(self.delay).await;
    self.inner.read_to_string(path).await
  }

  async fn write(&self, path: &Path, contents: &str) -> io::Result<()> {
    self.inner.write(path, contents).await
  }

  async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
    self.inner.rename(from, to).await
  }

  async fn copy(&self, from: &Path, to: &Path) -> io::Result<()> {
    self.inner.copy(from, to).await
  }

  async fn remove_file(&self, path: &Path) -> io::Result<()> {
    self.inner.remove_file(path).await
  }

  async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
    self.inner.create_dir_all(path).await
  }

  async fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
    self.inner.remove_dir_all(path).await
  }

  async fn list_dir(&self, path: &Path) -> io::Result<Vec<FileInfo>> {
    self.inner.list_dir(path).await
  }

  async fn metadata(&self, path: &Path) -> io::Result<FileInfo> {
    self.inner.metadata(path).await
  }

  async fn exists(&self, path: &Path) -> bool {
    self.inner.exists(path).await
  }
}

async fn outbox_count(engine: &QueueEngine) -> usize {
  let store = engine.store();
  store
    .list_files(&store.stage_dir(Stage::Outbox), None)
    .await
    .map(|f| f.len())
    .unwrap_or(0)
}

async fn stage_count(engine: &QueueEngine, stage: Stage) -> usize {
  let store = engine.store();
  store
    .list_files(&store.stage_dir(stage), None)
    .await
    .map(|f| f.len())
    .unwrap_or(0)
}

#[tokio::test]
async fn publish_subscribe_auto_acknowledge_round_trip() {
  let ws = TempWorkspace::new();
  let engine = QueueEngine::new(&config(&ws));
  engine.start().await.unwrap();

  let handler = Arc::new(Recorder::default());
  engine
    .subscribe(Team::Development, handler.clone(), poll_options(true))
    .await
    .unwrap();

  let mut input = NewTask::new(
    "Implement login flow",
    TaskType::Feature,
    Team::Planning,
    Team::Development,
  );
  input.content = "Details in the issue.".to_string();
  let published = engine.publish(input).await.unwrap();
  assert_eq!(published.metadata.status, TaskStatus::Pending);

  assert!(wait_until(WAIT, || async { outbox_count(&engine).await == 1 }).await);

  // The handler saw the task after the move to in-progress.
  let seen = handler.seen.lock().await;
  assert_eq!(seen.len(), 1);
  assert_eq!(seen[0].metadata.id, published.metadata.id);
  assert_eq!(seen[0].metadata.status, TaskStatus::InProgress);
  drop(seen);

  let done = engine
    .get_task(&published.metadata.id)
    .await
    .unwrap()
    .unwrap();
  assert_eq!(done.metadata.status, TaskStatus::Completed);
  assert!(done.metadata.completed_at.is_some());
  assert_eq!(done.content, "Details in the issue.");

  engine.stop().await;
}

#[tokio::test]
async fn backlog_drains_in_priority_then_fifo_order() {
  let ws = TempWorkspace::new();
  let engine = QueueEngine::new(&config(&ws));
  engine.start().await.unwrap();

  for priority in [
    Priority::Low,
    Priority::Critical,
    Priority::Medium,
    Priority::High,
  ] {
    let mut input = NewTask::new(
      format!("{priority} priority work"),
      TaskType::Feature,
      Team::Orchestrator,
      Team::Qa,
    );
    input.priority = Some(priority);
    engine.publish(input).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
  }

  let handler = Arc::new(Recorder::default());
  engine
    .subscribe(Team::Qa, handler.clone(), poll_options(true))
    .await
    .unwrap();

  assert!(wait_until(WAIT, || async { handler.calls().await == 4 }).await);

  let seen = handler.seen.lock().await;
  let order: Vec<Priority> = seen.iter().map(|d| d.metadata.priority).collect();
  assert_eq!(
    order,
    [
      Priority::Critical,
      Priority::High,
      Priority::Medium,
      Priority::Low
    ]
  );

  engine.stop().await;
}

#[tokio::test]
async fn failing_handler_requeues_then_succeeds() {
  let ws = TempWorkspace::new();
  let engine = QueueEngine::new(&config(&ws));
  engine.start().await.unwrap();

  let handler = Arc::new(Recorder::failing(1));
  engine
    .subscribe(Team::Devops, handler.clone(), poll_options(true))
    .await
    .unwrap();

  let mut input = NewTask::new(
    "Provision staging",
    TaskType::Infrastructure,
    Team::Orchestrator,
    Team::Devops,
  );
  input.max_retries = Some(2);
  let published = engine.publish(input).await.unwrap();

  assert!(wait_until(WAIT, || async { outbox_count(&engine).await == 1 }).await);
  assert_eq!(handler.calls().await, 2);

  let done = engine
    .get_task(&published.metadata.id)
    .await
    .unwrap()
    .unwrap();
  assert_eq!(done.metadata.status, TaskStatus::Completed);
  assert_eq!(done.metadata.retry_count, 1);

  engine.stop().await;
}

#[tokio::test]
async fn exhausted_retries_land_in_failed() {
  let ws = TempWorkspace::new();
  let engine = QueueEngine::new(&config(&ws));
  engine.start().await.unwrap();

  let handler = Arc::new(Recorder::failing(usize::MAX));
  engine
    .subscribe(Team::Development, handler.clone(), poll_options(true))
    .await
    .unwrap();

  let mut input = NewTask::new(
    "Fix flaky pipeline",
    TaskType::Bugfix,
    Team::Qa,
    Team::Development,
  );
  input.max_retries = Some(2);
  let published = engine.publish(input).await.unwrap();

  assert!(wait_until(WAIT, || async { stage_count(&engine, Stage::Failed).await == 1 }).await);

  // Initial attempt plus two retries.
  assert_eq!(handler.calls().await, 3);

  let failed = engine
    .get_task(&published.metadata.id)
    .await
    .unwrap()
    .unwrap();
  assert_eq!(failed.metadata.status, TaskStatus::Failed);
  assert_eq!(failed.metadata.retry_count, 2);

  engine.stop().await;
}

#[tokio::test]
async fn without_auto_acknowledge_the_task_waits_for_an_explicit_one() {
  let ws = TempWorkspace::new();
  let engine = QueueEngine::new(&config(&ws));
  engine.start().await.unwrap();

  let handler = Arc::new(Recorder::default());
  engine
    .subscribe(Team::Documentation, handler.clone(), poll_options(false))
    .await
    .unwrap();

  let published = engine
    .publish(NewTask::new(
      "Write release notes",
      TaskType::Documentation,
      Team::Development,
      Team::Documentation,
    ))
    .await
    .unwrap();

  assert!(
    wait_until(WAIT, || async {
      stage_count(&engine, Stage::InProgress).await == 1
    })
    .await
  );

  // A few more poll cycles must not re-dispatch the in-progress file.
  tokio::time::sleep(Duration::from_millis(200)).await;
  assert_eq!(handler.calls().await, 1);
  assert_eq!(stage_count(&engine, Stage::InProgress).await, 1);

  let done = engine
    .acknowledge(
      &published.metadata.id,
      TaskStatus::Completed,
      Some("Published to the changelog."),
    )
    .await
    .unwrap();
  assert!(done.content.contains("## Result"));
  assert!(done.content.contains("Published to the changelog."));
  assert_eq!(outbox_count(&engine).await, 1);
  assert_eq!(stage_count(&engine, Stage::InProgress).await, 0);

  engine.stop().await;
}

#[tokio::test]
async fn acknowledge_rejects_non_terminal_statuses() {
  let ws = TempWorkspace::new();
  let engine = QueueEngine::new(&config(&ws));
  engine.start().await.unwrap();

  let result = engine
    .acknowledge("0-0", TaskStatus::InProgress, None)
    .await;
  assert!(matches!(result, Err(QueueError::NotTerminal(_))));

  let result = engine.acknowledge("0-0", TaskStatus::Completed, None).await;
  assert!(matches!(result, Err(QueueError::NotFound(_))));

  engine.stop().await;
}

#[tokio::test]
async fn filtered_out_tasks_stay_queued() {
  let ws = TempWorkspace::new();
  let engine = QueueEngine::new(&config(&ws));
  engine.start().await.unwrap();

  let handler = Arc::new(Recorder::default());
  let options = SubscribeOptions {
    filter: TaskFilter {
      task_type: vec![TaskType::Bugfix],
      ..TaskFilter::default()
    },
    ..poll_options(true)
  };
  engine
    .subscribe(Team::Development, handler.clone(), options)
    .await
    .unwrap();

  engine
    .publish(NewTask::new(
      "New dashboard",
      TaskType::Feature,
      Team::Planning,
      Team::Development,
    ))
    .await
    .unwrap();
  engine
    .publish(NewTask::new(
      "Crash on save",
      TaskType::Bugfix,
      Team::Qa,
      Team::Development,
    ))
    .await
    .unwrap();

  assert!(wait_until(WAIT, || async { outbox_count(&engine).await == 1 }).await);
  tokio::time::sleep(Duration::from_millis(200)).await;

  let seen = handler.seen.lock().await;
  assert_eq!(seen.len(), 1);
  assert_eq!(seen[0].metadata.task_type, TaskType::Bugfix);
  drop(seen);

  // The feature task is still waiting in the inbox.
  let inbox = engine.store().inbox_dir(Team::Development);
  assert_eq!(engine.store().list_files(&inbox, None).await.unwrap().len(), 1);

  engine.stop().await;
}

#[tokio::test]
async fn a_slow_handler_is_never_invoked_twice_for_one_task() {
  let ws = TempWorkspace::new();
  let engine = QueueEngine::new(&config(&ws));
  engine.start().await.unwrap();

  let handler = Arc::new(Recorder {
    delay: Some(Duration::from_millis(300)),
    ..Recorder::default()
  });
  engine
    .subscribe(Team::Qa, handler.clone(), poll_options(true))
    .await
    .unwrap();

  engine
    .publish(NewTask::new(
      "Run the regression suite",
      TaskType::Test,
      Team::Development,
      Team::Qa,
    ))
    .await
    .unwrap();

  assert!(wait_until(WAIT, || async { outbox_count(&engine).await == 1 }).await);
  assert_eq!(handler.calls().await, 1);

  engine.stop().await;
}

#[tokio::test]
async fn stop_waits_for_a_started_callback_to_finish() {
  let ws = TempWorkspace::new();
  let engine = QueueEngine::new(&config(&ws));
  engine.start().await.unwrap();

  let handler = Arc::new(Recorder {
    delay: Some(Duration::from_millis(400)),
    ..Recorder::default()
  });
  engine
    .subscribe(Team::Qa, handler.clone(), poll_options(true))
    .await
    .unwrap();

  engine
    .publish(NewTask::new(
      "Finish what you started",
      TaskType::Test,
      Team::Development,
      Team::Qa,
    ))
    .await
    .unwrap();

  assert!(wait_until(WAIT, || async { handler.started() == 1 }).await);
  engine.stop().await;

  // The callback ran to completion and the task was acknowledged before
  // stop returned; nothing is stranded in in-progress.
  assert_eq!(handler.calls().await, 1);
  assert_eq!(stage_count(&engine, Stage::InProgress).await, 0);
  assert_eq!(outbox_count(&engine).await, 1);
}

#[tokio::test]
async fn overlapping_drains_claim_a_task_only_once() {
  let ws = TempWorkspace::new();
  let fs = Arc::new(SlowReadFs {
    inner: TokioFs,
    delay: Duration::from_millis(200),
  });
  let engine = QueueEngine::with_fs(&config(&ws), fs);
  engine.start().await.unwrap();

  let first = Arc::new(Recorder::default());
  engine
    .subscribe(Team::Qa, first.clone(), poll_options(true))
    .await
    .unwrap();

  engine
    .publish(NewTask::new(
      "Count me once",
      TaskType::Test,
      Team::Development,
      Team::Qa,
    ))
    .await
    .unwrap();

  // Let the poll driver start staging (parked in the slow read), then force
  // a second drain over the same inbox via another subscription. The file
  // is still listed in the inbox, so only the in-flight claim prevents a
  // double dispatch.
  tokio::time::sleep(Duration::from_millis(75)).await;
  let second = Arc::new(Recorder::default());
  engine
    .subscribe(Team::Qa, second.clone(), poll_options(true))
    .await
    .unwrap();

  assert!(wait_until(WAIT, || async { outbox_count(&engine).await == 1 }).await);
  tokio::time::sleep(Duration::from_millis(300)).await;

  assert_eq!(first.calls().await, 1);
  assert!(second.calls().await <= 1);

  engine.stop().await;
}

#[tokio::test]
async fn unrecognized_inbox_files_are_flagged_once_and_left_alone() {
  use courier_core::engine::EventKind;

  let ws = TempWorkspace::new();
  let engine = QueueEngine::new(&config(&ws));
  engine.start().await.unwrap();
  let mut events = engine.events();

  let store = engine.store();
  let stray = store.inbox_dir(Team::Qa).join("notes.md");
  store.write_file(&stray, "scratch pad").await.unwrap();

  let handler = Arc::new(Recorder::default());
  engine
    .subscribe(Team::Qa, handler.clone(), poll_options(true))
    .await
    .unwrap();

  // Several poll cycles pass; the stray file is reported a single time.
  tokio::time::sleep(Duration::from_millis(300)).await;
  engine.stop().await;

  let mut reports = 0;
  while let Ok(event) = events.try_recv() {
    if let EventKind::Error { message, .. } = &event.kind
      && message.contains("notes.md")
    {
      reports += 1;
    }
  }
  assert_eq!(reports, 1);
  assert_eq!(handler.calls().await, 0);
  assert!(store.file_exists(&stray).await);
}

#[tokio::test]
async fn watch_delivery_dispatches_new_files() {
  let ws = TempWorkspace::new();
  let engine = QueueEngine::new(&config(&ws));
  engine.start().await.unwrap();

  let handler = Arc::new(Recorder::default());
  let options = SubscribeOptions {
    auto_acknowledge: true,
    delivery: DeliveryMode::Watch,
    ..SubscribeOptions::default()
  };
  engine
    .subscribe(Team::Planning, handler.clone(), options)
    .await
    .unwrap();

  engine
    .publish(NewTask::new(
      "Break down the epic",
      TaskType::Planning,
      Team::Orchestrator,
      Team::Planning,
    ))
    .await
    .unwrap();

  assert!(wait_until(WAIT, || async { outbox_count(&engine).await == 1 }).await);
  assert_eq!(handler.calls().await, 1);

  engine.stop().await;
}

#[tokio::test]
async fn subscribe_requires_a_started_engine() {
  let ws = TempWorkspace::new();
  let engine = QueueEngine::new(&config(&ws));

  let result = engine
    .subscribe(Team::Qa, Arc::new(Recorder::default()), poll_options(true))
    .await;
  assert!(matches!(result, Err(QueueError::Stopped)));

  engine.start().await.unwrap();
  assert!(engine.is_running());
  engine.stop().await;
  assert!(!engine.is_running());
  // Stopping twice is harmless.
  engine.stop().await;
}

#[tokio::test]
async fn unsubscribing_the_last_handler_stops_dispatch() {
  let ws = TempWorkspace::new();
  let engine = QueueEngine::new(&config(&ws));
  engine.start().await.unwrap();

  let handler = Arc::new(Recorder::default());
  let handle = engine
    .subscribe(Team::Qa, handler.clone(), poll_options(true))
    .await
    .unwrap();
  engine.unsubscribe(handle).await;

  engine
    .publish(NewTask::new(
      "Late arrival",
      TaskType::Test,
      Team::Development,
      Team::Qa,
    ))
    .await
    .unwrap();

  tokio::time::sleep(Duration::from_millis(250)).await;
  assert_eq!(handler.calls().await, 0);
  let inbox = engine.store().inbox_dir(Team::Qa);
  assert_eq!(engine.store().list_files(&inbox, None).await.unwrap().len(), 1);

  engine.stop().await;
}

#[tokio::test]
async fn events_trace_the_task_lifecycle() {
  use courier_core::engine::EventKind;

  let ws = TempWorkspace::new();
  let engine = QueueEngine::new(&config(&ws));
  engine.start().await.unwrap();
  let mut events = engine.events();

  let handler = Arc::new(Recorder::default());
  engine
    .subscribe(Team::Development, handler, poll_options(true))
    .await
    .unwrap();

  let published = engine
    .publish(NewTask::new(
      "Trace me",
      TaskType::Feature,
      Team::Planning,
      Team::Development,
    ))
    .await
    .unwrap();

  assert!(wait_until(WAIT, || async { outbox_count(&engine).await == 1 }).await);
  engine.stop().await;

  let mut kinds = Vec::new();
  while let Ok(event) = events.try_recv() {
    let matches_id = match &event.kind {
      EventKind::Published { task_id, .. }
      | EventKind::Received { task_id, .. }
      | EventKind::Started { task_id, .. }
      | EventKind::Completed { task_id, .. }
      | EventKind::Failed { task_id, .. }
      | EventKind::Retry { task_id, .. } => task_id == &published.metadata.id,
      EventKind::Error { .. } => false,
    };
    if matches_id {
      kinds.push(std::mem::discriminant(&event.kind));
    }
  }
  let expected = [
    std::mem::discriminant(&EventKind::Published {
      task_id: String::new(),
      to: Team::Development,
      priority: Priority::Medium,
    }),
    std::mem::discriminant(&EventKind::Received {
      task_id: String::new(),
      team: Team::Development,
    }),
    std::mem::discriminant(&EventKind::Started {
      task_id: String::new(),
      team: Team::Development,
    }),
    std::mem::discriminant(&EventKind::Completed {
      task_id: String::new(),
      team: Team::Development,
    }),
  ];
  assert_eq!(kinds, expected);
}

#[tokio::test]
async fn get_tasks_and_stats_reflect_the_stages() {
  let ws = TempWorkspace::new();
  let engine = QueueEngine::new(&config(&ws));
  engine.start().await.unwrap();

  let handler = Arc::new(Recorder::default());
  engine
    .subscribe(Team::Development, handler, poll_options(true))
    .await
    .unwrap();

  engine
    .publish(NewTask::new(
      "Ship it",
      TaskType::Feature,
      Team::Planning,
      Team::Development,
    ))
    .await
    .unwrap();
  assert!(wait_until(WAIT, || async { outbox_count(&engine).await == 1 }).await);

  let completed = engine
    .get_tasks(&TaskFilter {
      status: vec![TaskStatus::Completed],
      ..TaskFilter::default()
    })
    .await
    .unwrap();
  assert_eq!(completed.len(), 1);
  assert_eq!(completed[0].metadata.title, "Ship it");

  let stats = engine.stats().await.unwrap();
  assert_eq!(stats.outbox, 1);
  assert_eq!(stats.in_progress, 0);
  assert_eq!(stats.inbox.get(&Team::Development), Some(&0));

  engine.stop().await;
}

#[tokio::test]
async fn archive_and_purge_age_out_finished_tasks() {
  let ws = TempWorkspace::new();
  let engine = QueueEngine::new(&config(&ws));
  engine.start().await.unwrap();

  let handler = Arc::new(Recorder::default());
  engine
    .subscribe(Team::Qa, handler, poll_options(true))
    .await
    .unwrap();
  engine
    .publish(NewTask::new(
      "Old enough to archive",
      TaskType::Test,
      Team::Development,
      Team::Qa,
    ))
    .await
    .unwrap();
  assert!(wait_until(WAIT, || async { outbox_count(&engine).await == 1 }).await);

  tokio::time::sleep(Duration::from_millis(80)).await;
  let archived = engine.archive_old_tasks(Duration::from_millis(10)).await.unwrap();
  assert_eq!(archived, 1);
  assert_eq!(outbox_count(&engine).await, 0);
  assert_eq!(stage_count(&engine, Stage::Archive).await, 1);

  tokio::time::sleep(Duration::from_millis(80)).await;
  let purged = engine.purge_archive(Duration::from_millis(10)).await.unwrap();
  assert_eq!(purged, 1);
  assert_eq!(stage_count(&engine, Stage::Archive).await, 0);

  engine.stop().await;
}
