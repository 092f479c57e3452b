use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Temporary workspace root for tests.
pub struct TempWorkspace {
  pub root: tempfile::TempDir,
}

impl Default for TempWorkspace {
  fn default() -> Self {
    Self::new()
  }
}

impl TempWorkspace {
  pub fn new() -> Self {
    let root = tempfile::tempdir().expect("tempdir");
    Self { root }
  }

  pub fn path(&self) -> PathBuf {
    self.root.path().to_path_buf()
  }

  /// Workspace directory inside the temp root.
  pub fn workspace(&self) -> PathBuf {
    self.path().join(".agent-workspace")
  }

  /// Names of the regular files directly inside `dir` (empty if missing),
  /// excluding dotfiles, sorted.
  pub fn file_names(&self, dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
      .map(|entries| {
        entries
          .filter_map(|e| e.ok())
          .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
          .map(|e| e.file_name().to_string_lossy().into_owned())
          .filter(|n| !n.starts_with('.'))
          .collect()
      })
      .unwrap_or_default();
    names.sort();
    names
  }
}

/// Poll `cond` until it returns true or `timeout` elapses. Returns whether
/// the condition was met.
pub async fn wait_until<F, Fut>(timeout: Duration, mut cond: F) -> bool
where
  F: FnMut() -> Fut,
  Fut: Future<Output = bool>,
{
  let deadline = Instant::now() + timeout;
  loop {
    if cond().await {
      return true;
    }
    if Instant::now() >= deadline {
      return false;
    }
    tokio::time::sleep(Duration::from_millis(25)).await;
  }
}
