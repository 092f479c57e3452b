use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;

/// Metadata for one regular file, as returned by [`FileSystem::list_dir`].
#[derive(Debug, Clone)]
pub struct FileInfo {
  pub path: PathBuf,
  pub name: String,
  /// Creation time where the platform records it, otherwise mtime.
  pub created: SystemTime,
  pub modified: SystemTime,
  pub len: u64,
}

/// Filesystem port. The workspace store talks only to this trait so that
/// everything above it can run against an alternative implementation.
#[async_trait]
pub trait FileSystem: Send + Sync {
  async fn read_to_string(&self, path: &Path) -> io::Result<String>;
  async fn write(&self, path: &Path, contents: &str) -> io::Result<()>;
  /// Atomic on a single filesystem; the basis for crash-consistent moves.
  async fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
  async fn copy(&self, from: &Path, to: &Path) -> io::Result<()>;
  async fn remove_file(&self, path: &Path) -> io::Result<()>;
  async fn create_dir_all(&self, path: &Path) -> io::Result<()>;
  async fn remove_dir_all(&self, path: &Path) -> io::Result<()>;
  /// Regular files directly inside `path`, in no particular order.
  async fn list_dir(&self, path: &Path) -> io::Result<Vec<FileInfo>>;
  async fn metadata(&self, path: &Path) -> io::Result<FileInfo>;
  async fn exists(&self, path: &Path) -> bool;
}

/// Production implementation on top of `tokio::fs`.
#[derive(Debug, Clone, Default)]
pub struct TokioFs;

fn file_info(path: PathBuf, meta: &std::fs::Metadata) -> FileInfo {
  let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
  let created = meta.created().unwrap_or(modified);
  let name = path
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_default();
  FileInfo {
    name,
    created,
    modified,
    len: meta.len(),
    path,
  }
}

#[async_trait]
impl FileSystem for TokioFs {
  async fn read_to_string(&self, path: &Path) -> io::Result<String> {
    tokio::fs::read_to_string(path).await
  }

  async fn write(&self, path: &Path, contents: &str) -> io::Result<()> {
    tokio::fs::write(path, contents).await
  }

  async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
    tokio::fs::rename(from, to).await
  }

  async fn copy(&self, from: &Path, to: &Path) -> io::Result<()> {
    tokio::fs::copy(from, to).await.map(|_| ())
  }

  async fn remove_file(&self, path: &Path) -> io::Result<()> {
    tokio::fs::remove_file(path).await
  }

  async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
    tokio::fs::create_dir_all(path).await
  }

  async fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
    tokio::fs::remove_dir_all(path).await
  }

  async fn list_dir(&self, path: &Path) -> io::Result<Vec<FileInfo>> {
    let mut entries = tokio::fs::read_dir(path).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
      let meta = entry.metadata().await?;
      if meta.is_file() {
        files.push(file_info(entry.path(), &meta));
      }
    }
    Ok(files)
  }

  async fn metadata(&self, path: &Path) -> io::Result<FileInfo> {
    let meta = tokio::fs::metadata(path).await?;
    Ok(file_info(path.to_path_buf(), &meta))
  }

  async fn exists(&self, path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
  }
}
