use std::sync::Arc;
use std::time::Duration;

use courier_core::adapters::fs::TokioFs;
use courier_core::{Stage, Team, WorkspaceStore};
use test_support::TempWorkspace;

fn store(ws: &TempWorkspace) -> WorkspaceStore {
  WorkspaceStore::new(Arc::new(TokioFs), ws.workspace(), Team::all())
}

#[tokio::test]
async fn initialize_creates_the_full_taxonomy() {
  let ws = TempWorkspace::new();
  let store = store(&ws);
  store.initialize().await.unwrap();

  for team in Team::all() {
    let inbox = store.inbox_dir(team);
    assert!(inbox.is_dir(), "missing inbox for {team}");
    assert!(inbox.join(".gitkeep").is_file());
  }
  for stage in [
    Stage::Outbox,
    Stage::InProgress,
    Stage::Failed,
    Stage::Archive,
    Stage::Knowledge,
    Stage::Metrics,
  ] {
    assert!(store.stage_dir(stage).is_dir(), "missing {stage:?}");
  }
}

#[tokio::test]
async fn list_files_skips_placeholders_and_orders_by_age() {
  let ws = TempWorkspace::new();
  let store = store(&ws);
  store.initialize().await.unwrap();
  let outbox = store.stage_dir(Stage::Outbox);

  // Written in reverse lexical order so sorting by name would differ.
  for name in ["zz-first.md", "mm-second.md", "aa-third.md"] {
    store.write_file(&outbox.join(name), "x").await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
  }

  let files = store.list_files(&outbox, None).await.unwrap();
  let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
  assert_eq!(names, ["zz-first.md", "mm-second.md", "aa-third.md"]);

  let filtered = store.list_files(&outbox, Some("second")).await.unwrap();
  assert_eq!(filtered.len(), 1);
  assert_eq!(filtered[0].name, "mm-second.md");
}

#[tokio::test]
async fn list_files_on_a_missing_directory_is_empty() {
  let ws = TempWorkspace::new();
  let store = store(&ws);
  let files = store
    .list_files(&ws.workspace().join("does-not-exist"), None)
    .await
    .unwrap();
  assert!(files.is_empty());
}

#[tokio::test]
async fn move_file_relocates_under_the_destination() {
  let ws = TempWorkspace::new();
  let store = store(&ws);
  store.initialize().await.unwrap();

  let src = store.inbox_dir(Team::Development).join("task.md");
  store.write_file(&src, "body").await.unwrap();
  let dest = store
    .move_file(&src, &store.stage_dir(Stage::InProgress))
    .await
    .unwrap();

  assert!(!src.exists());
  assert!(dest.exists());
  assert_eq!(dest.parent().unwrap(), store.stage_dir(Stage::InProgress));
  assert_eq!(store.read_file(&dest).await.unwrap(), "body");
}

#[tokio::test]
async fn cleanup_removes_only_files_older_than_the_cutoff() {
  let ws = TempWorkspace::new();
  let store = store(&ws);
  store.initialize().await.unwrap();
  let archive = store.stage_dir(Stage::Archive);

  store.write_file(&archive.join("old.md"), "x").await.unwrap();
  tokio::time::sleep(Duration::from_millis(80)).await;

  let removed = store
    .cleanup_old_files(&archive, Duration::from_millis(10))
    .await
    .unwrap();
  assert_eq!(removed, 1);
  assert!(!archive.join("old.md").exists());

  store.write_file(&archive.join("new.md"), "x").await.unwrap();
  let removed = store
    .cleanup_old_files(&archive, Duration::from_secs(3600))
    .await
    .unwrap();
  assert_eq!(removed, 0);
  assert!(archive.join("new.md").exists());
}

#[tokio::test]
async fn stats_count_files_per_team_and_stage() {
  let ws = TempWorkspace::new();
  let store = store(&ws);
  store.initialize().await.unwrap();

  store
    .write_file(&store.inbox_dir(Team::Qa).join("a.md"), "x")
    .await
    .unwrap();
  store
    .write_file(&store.inbox_dir(Team::Qa).join("b.md"), "x")
    .await
    .unwrap();
  store
    .write_file(&store.stage_dir(Stage::Outbox).join("c.md"), "x")
    .await
    .unwrap();
  store
    .write_file(&store.stage_dir(Stage::Failed).join("d.md"), "x")
    .await
    .unwrap();

  let stats = store.stats().await.unwrap();
  assert_eq!(stats.inbox.get(&Team::Qa), Some(&2));
  assert_eq!(stats.inbox.get(&Team::Planning), Some(&0));
  assert_eq!(stats.outbox, 1);
  assert_eq!(stats.failed, 1);
  assert_eq!(stats.in_progress, 0);
}

#[tokio::test]
async fn reset_empties_stages_but_keeps_the_structure() {
  let ws = TempWorkspace::new();
  let store = store(&ws);
  store.initialize().await.unwrap();

  store
    .write_file(&store.inbox_dir(Team::Development).join("a.md"), "x")
    .await
    .unwrap();
  store
    .write_file(&store.stage_dir(Stage::Outbox).join("b.md"), "x")
    .await
    .unwrap();

  store.reset().await.unwrap();

  assert!(store.inbox_dir(Team::Development).is_dir());
  assert!(store.stage_dir(Stage::Outbox).is_dir());
  assert!(ws.file_names(&store.inbox_dir(Team::Development)).is_empty());
  assert!(ws.file_names(&store.stage_dir(Stage::Outbox)).is_empty());
}
