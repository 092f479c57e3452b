use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::QueueEngine;
use super::subscription::DeliveryMode;
use crate::domain::task::Team;

/// Drives drains for one team's inbox. Holding the `notify` watcher keeps
/// the OS watch alive; shutdown is cooperative so a drain that is mid-way
/// through dispatching always runs to completion.
pub(crate) struct DrainDriver {
  stop: watch::Sender<bool>,
  task: JoinHandle<()>,
  _watcher: Option<notify::RecommendedWatcher>,
}

impl DrainDriver {
  /// Signal the drive loop and wait for it to finish its current drain.
  /// Started subscriber callbacks are never cancelled.
  pub async fn shutdown(self) {
    let _ = self.stop.send(true);
    let _ = self.task.await;
  }
}

/// Arm the requested delivery mode. A watch that cannot be established
/// degrades to polling at `fallback_interval`; the choice is made here,
/// once, not per event.
pub(crate) fn arm(
  engine: QueueEngine,
  team: Team,
  mode: DeliveryMode,
  fallback_interval: Duration,
) -> DrainDriver {
  match mode {
    DeliveryMode::Watch => match try_watch(engine.clone(), team) {
      Ok(driver) => driver,
      Err(e) => {
        warn!(
          event = "watch_unavailable",
          team = %team,
          error = %e,
          "falling back to polling"
        );
        poll(engine, team, fallback_interval)
      }
    },
    DeliveryMode::Poll(interval) => poll(engine, team, interval),
  }
}

fn try_watch(engine: QueueEngine, team: Team) -> notify::Result<DrainDriver> {
  let dir = engine.store().inbox_dir(team);
  let (tx, mut rx) = mpsc::unbounded_channel();
  let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
    if let Ok(event) = res
      && (event.kind.is_create() || event.kind.is_modify())
    {
      let _ = tx.send(());
    }
  })?;
  watcher.watch(&dir, RecursiveMode::Recursive)?;
  debug!(event = "watch_armed", team = %team, dir = %dir.display(), "filesystem watch armed");

  let (stop, mut stop_rx) = watch::channel(false);
  let task = tokio::spawn(async move {
    loop {
      // The stop signal only interrupts the wait for the next event; a
      // drain already underway finishes before the loop re-selects.
      tokio::select! {
        _ = stop_rx.changed() => break,
        received = rx.recv() => {
          if received.is_none() || !engine.is_running() {
            break;
          }
          engine.drain(team).await;
        }
      }
    }
  });
  Ok(DrainDriver {
    stop,
    task,
    _watcher: Some(watcher),
  })
}

fn poll(engine: QueueEngine, team: Team, interval: Duration) -> DrainDriver {
  debug!(event = "poll_armed", team = %team, interval_ms = interval.as_millis() as u64, "polling armed");
  let (stop, mut stop_rx) = watch::channel(false);
  let task = tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // First tick fires immediately; the subscribe path already drained.
    ticker.tick().await;
    loop {
      tokio::select! {
        _ = stop_rx.changed() => break,
        _ = ticker.tick() => {
          if !engine.is_running() {
            break;
          }
          engine.drain(team).await;
        }
      }
    }
  });
  DrainDriver {
    stop,
    task,
    _watcher: None,
  }
}
