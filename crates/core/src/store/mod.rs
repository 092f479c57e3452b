use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use tracing::debug;

use crate::adapters::fs::{FileInfo, FileSystem};
use crate::domain::task::Team;

/// Placeholder dropped into otherwise-empty directories so the taxonomy
/// survives tools that prune empty folders.
pub const PLACEHOLDER: &str = ".gitkeep";

/// Stages a task file moves through after leaving a team inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
  Outbox,
  InProgress,
  Failed,
  Archive,
  Knowledge,
  Metrics,
}

impl Stage {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Outbox => "outbox",
      Self::InProgress => "in-progress",
      Self::Failed => "failed",
      Self::Archive => "archive",
      Self::Knowledge => "knowledge",
      Self::Metrics => "metrics",
    }
  }

  fn all() -> [Stage; 6] {
    [
      Self::Outbox,
      Self::InProgress,
      Self::Failed,
      Self::Archive,
      Self::Knowledge,
      Self::Metrics,
    ]
  }
}

/// Per-team and per-stage counts for operational visibility.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkspaceStats {
  pub inbox: BTreeMap<Team, usize>,
  pub outbox: usize,
  pub in_progress: usize,
  pub failed: usize,
  pub archive: usize,
}

/// Owns the directory taxonomy rooted at the workspace path and provides
/// the file primitives the queue engine builds on. All relocation goes
/// through [`WorkspaceStore::move_file`], a rename, so a task file is
/// visible in exactly one directory at any instant.
pub struct WorkspaceStore {
  fs: Arc<dyn FileSystem>,
  root: PathBuf,
  teams: Vec<Team>,
  initialized: AtomicBool,
}

impl WorkspaceStore {
  pub fn new(fs: Arc<dyn FileSystem>, root: impl Into<PathBuf>, teams: Vec<Team>) -> Self {
    Self {
      fs,
      root: root.into(),
      teams,
      initialized: AtomicBool::new(false),
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn teams(&self) -> &[Team] {
    &self.teams
  }

  pub fn stage_dir(&self, stage: Stage) -> PathBuf {
    self.root.join(stage.as_str())
  }

  pub fn inbox_dir(&self, team: Team) -> PathBuf {
    self.root.join("inbox").join(team.as_str())
  }

  /// Inbox for a sub-team, e.g. `inbox/development/frontend`.
  pub fn subteam_inbox_dir(&self, team: Team, subteam: &str) -> PathBuf {
    self.inbox_dir(team).join(subteam)
  }

  /// Create every directory in the taxonomy and drop a placeholder into
  /// each leaf. Safe to call any number of times.
  pub async fn initialize(&self) -> io::Result<()> {
    for stage in Stage::all() {
      self.ensure_dir(&self.stage_dir(stage)).await?;
    }
    for team in &self.teams {
      self.ensure_dir(&self.inbox_dir(*team)).await?;
    }
    self.initialized.store(true, Ordering::SeqCst);
    debug!(event = "workspace_initialized", root = %self.root.display(), "workspace layout ready");
    Ok(())
  }

  /// Lazily initialize on first use.
  pub async fn ensure_initialized(&self) -> io::Result<()> {
    if self.initialized.load(Ordering::SeqCst) {
      return Ok(());
    }
    self.initialize().await
  }

  async fn ensure_dir(&self, dir: &Path) -> io::Result<()> {
    self.fs.create_dir_all(dir).await?;
    let marker = dir.join(PLACEHOLDER);
    if !self.fs.exists(&marker).await {
      self.fs.write(&marker, "").await?;
    }
    Ok(())
  }

  /// Files in `dir` matching an optional name pattern, oldest first
  /// (creation time ascending, name as the FIFO tiebreak). The placeholder
  /// is never returned. A missing directory lists as empty.
  pub async fn list_files(&self, dir: &Path, pattern: Option<&str>) -> io::Result<Vec<FileInfo>> {
    let mut files = match self.fs.list_dir(dir).await {
      Ok(files) => files,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(e),
    };
    files.retain(|f| f.name != PLACEHOLDER);
    if let Some(pattern) = pattern {
      files.retain(|f| f.name.contains(pattern));
    }
    files.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.name.cmp(&b.name)));
    Ok(files)
  }

  pub async fn read_file(&self, path: &Path) -> io::Result<String> {
    self.fs.read_to_string(path).await
  }

  /// Write, creating parent directories as needed.
  pub async fn write_file(&self, path: &Path, contents: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
      self.fs.create_dir_all(parent).await?;
    }
    self.fs.write(path, contents).await
  }

  /// Relocate `src` into `dest_dir` keeping its name. Implemented as a
  /// rename: atomic on one filesystem, so a crash mid-transition leaves the
  /// file wholly in its old or wholly in its new location.
  pub async fn move_file(&self, src: &Path, dest_dir: &Path) -> io::Result<PathBuf> {
    let name = src
      .file_name()
      .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "source has no file name"))?;
    self.fs.create_dir_all(dest_dir).await?;
    let dest = dest_dir.join(name);
    self.fs.rename(src, &dest).await?;
    Ok(dest)
  }

  pub async fn copy_file(&self, src: &Path, dest_dir: &Path) -> io::Result<PathBuf> {
    let name = src
      .file_name()
      .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "source has no file name"))?;
    self.fs.create_dir_all(dest_dir).await?;
    let dest = dest_dir.join(name);
    self.fs.copy(src, &dest).await?;
    Ok(dest)
  }

  pub async fn delete_file(&self, path: &Path) -> io::Result<()> {
    self.fs.remove_file(path).await
  }

  pub async fn file_exists(&self, path: &Path) -> bool {
    self.fs.exists(path).await
  }

  pub async fn file_stats(&self, path: &Path) -> io::Result<FileInfo> {
    self.fs.metadata(path).await
  }

  /// Delete files in `dir` older than `max_age`. Files that vanish
  /// mid-sweep are counted as already gone.
  pub async fn cleanup_old_files(&self, dir: &Path, max_age: Duration) -> io::Result<usize> {
    let now = SystemTime::now();
    let mut removed = 0;
    for file in self.list_files(dir, None).await? {
      let old_enough = now
        .duration_since(file.created)
        .map(|age| age > max_age)
        .unwrap_or(false);
      if old_enough {
        match self.fs.remove_file(&file.path).await {
          Ok(()) => removed += 1,
          Err(e) if e.kind() == io::ErrorKind::NotFound => {}
          Err(e) => return Err(e),
        }
      }
    }
    Ok(removed)
  }

  pub async fn stats(&self) -> io::Result<WorkspaceStats> {
    let mut stats = WorkspaceStats::default();
    for team in &self.teams {
      let count = self.list_files(&self.inbox_dir(*team), None).await?.len();
      stats.inbox.insert(*team, count);
    }
    stats.outbox = self.list_files(&self.stage_dir(Stage::Outbox), None).await?.len();
    stats.in_progress = self
      .list_files(&self.stage_dir(Stage::InProgress), None)
      .await?
      .len();
    stats.failed = self.list_files(&self.stage_dir(Stage::Failed), None).await?.len();
    stats.archive = self.list_files(&self.stage_dir(Stage::Archive), None).await?.len();
    Ok(stats)
  }

  /// Remove every task file from the active directories but keep the
  /// structure (and placeholders) intact.
  pub async fn reset(&self) -> io::Result<()> {
    for team in &self.teams {
      self.clear_dir(&self.inbox_dir(*team)).await?;
    }
    for stage in [Stage::Outbox, Stage::InProgress, Stage::Failed, Stage::Archive] {
      self.clear_dir(&self.stage_dir(stage)).await?;
    }
    Ok(())
  }

  async fn clear_dir(&self, dir: &Path) -> io::Result<()> {
    for file in self.list_files(dir, None).await? {
      match self.fs.remove_file(&file.path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
      }
    }
    Ok(())
  }

  /// Remove the whole workspace tree.
  pub async fn destroy(&self) -> io::Result<()> {
    match self.fs.remove_dir_all(&self.root).await {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::NotFound => {}
      Err(e) => return Err(e),
    }
    self.initialized.store(false, Ordering::SeqCst);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn directory_layout() {
    let store = WorkspaceStore::new(
      Arc::new(crate::adapters::fs::TokioFs),
      "/ws",
      vec![Team::Planning],
    );
    assert_eq!(store.stage_dir(Stage::InProgress), PathBuf::from("/ws/in-progress"));
    assert_eq!(store.inbox_dir(Team::Planning), PathBuf::from("/ws/inbox/planning"));
    assert_eq!(
      store.subteam_inbox_dir(Team::Development, "frontend"),
      PathBuf::from("/ws/inbox/development/frontend")
    );
  }
}
