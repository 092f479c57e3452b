use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::OnceLock;

use tracing::{info, subscriber::set_global_default};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};

use crate::config::{Config, LogLevel};

static WORKER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize logging into the workspace the config points at.
pub fn init_from(config: &Config) {
  init(&config.logs_path(), config.log_level);
}

/// Initialize structured JSON logging to the given `.jsonl` path (by
/// convention the workspace's `metrics/queue.log.jsonl`). Repeat calls are
/// harmless: a later `set_global_default` simply fails and is ignored.
pub fn init(logs_path: &Path, level: LogLevel) {
  if let Some(parent) = logs_path.parent() {
    let _ = fs::create_dir_all(parent);
  }

  let file = OpenOptions::new()
    .create(true)
    .append(true)
    .open(logs_path)
    .expect("open log file for append");

  // Non-blocking writer so queue processing never stalls on disk IO.
  let (nb_writer, guard) = tracing_appender::non_blocking(file);
  let _ = WORKER_GUARD.set(guard);

  let filter = EnvFilter::new(match level {
    LogLevel::Off => "off",
    LogLevel::Warn => "warn",
    LogLevel::Info => "info",
    LogLevel::Debug => "debug",
    LogLevel::Trace => "trace",
  });

  let json_layer = fmt::layer()
    .with_timer(ChronoUtc::rfc_3339())
    .json()
    .with_level(true)
    .with_target(false)
    .with_thread_ids(false)
    .with_thread_names(false)
    .with_writer(move || nb_writer.clone());

  let subscriber = Registry::default().with(filter).with(json_layer);
  let _ = set_global_default(subscriber);

  info!(
    event = "logging_initialized",
    logs_path = %logs_path.display(),
    level = ?level,
    "logging initialized"
  );
}
