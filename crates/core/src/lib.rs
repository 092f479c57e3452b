//! Core library for the courier task queue.
//!
//! Routes units of work between agent teams using plain files as the
//! transport and durability layer: a task is a markdown document with a
//! YAML frontmatter block, and its lifecycle is mirrored by its location
//! in the workspace directory tree (`inbox/<team>` → `in-progress` →
//! `outbox` | `failed`, cycling back through `inbox` on retry).
//!
//! Quick start:
//! - Build a [`config::Config`] (or `config::load` a `courier.toml`).
//! - Create a [`engine::QueueEngine`] and `start()` it.
//! - `publish` tasks and `subscribe` handlers per team; consumers either
//!   auto-acknowledge or call `acknowledge` explicitly.
//!
//! Delivery is at-least-once; subscribers own idempotency. A single
//! process owns a given workspace directory at a time.

pub mod adapters;
pub mod config;
pub mod domain;
pub mod engine;
pub mod logging;
pub mod store;

pub use config::Config;
pub use domain::document::{ParseError, SerializeError};
pub use domain::task::{
  NewTask, Priority, TaskDocument, TaskMetadata, TaskStatus, TaskType, Team,
};
pub use engine::{
  DeliveryMode, QueueEngine, QueueError, SubscribeOptions, SubscriptionHandle, TaskFilter,
  TaskHandler,
};
pub use store::{Stage, WorkspaceStats, WorkspaceStore};
