//! Task persistence.
//!
//! All backends share one contract: forward-only updates, expiry of terminal
//! tasks one hour after start, and delete-on-read of expired entries where
//! there is shared state to delete from.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{Config, StoreBackend};
use crate::database::setup_database;
use crate::models::{Lookup, Task, TaskState, TaskStatus};

pub mod memory;
pub mod postgres;
pub mod stateless;

pub use memory::MemoryTaskStore;
pub use postgres::PgTaskStore;
pub use stateless::StatelessTaskStore;

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("task {0} not found")]
  NotFound(String),

  #[error("invalid transition for task {task_id}: {from} -> {to}")]
  InvalidTransition {
    task_id: String,
    from: TaskStatus,
    to: TaskStatus,
  },

  #[error("corrupt task data for {task_id}: {reason}")]
  Corrupt { task_id: String, reason: String },
}

impl StoreError {
  pub(crate) fn transition(task_id: &str, (from, to): (TaskStatus, TaskStatus)) -> Self {
    StoreError::InvalidTransition { task_id: task_id.to_string(), from, to }
  }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
  /// Stores `task` and returns the identifier callers must use from now on.
  async fn create(&self, task_id: &str, task: &Task) -> Result<String, StoreError>;

  /// Reads a task, deleting it if it is past expiry.
  async fn lookup(&self, task_id: &str) -> Result<Lookup, StoreError>;

  async fn get(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
    Ok(self.lookup(task_id).await?.into_task())
  }

  /// Moves the task to `next` and returns the identifier to use afterwards.
  async fn update(&self, task_id: &str, next: TaskState) -> Result<String, StoreError>;

  async fn delete(&self, task_id: &str) -> Result<bool, StoreError>;

  async fn list_ids(&self) -> Result<Vec<String>, StoreError>;

  /// Removes expired terminal tasks, returning how many went away.
  async fn cleanup(&self) -> Result<u64, StoreError>;
}

pub async fn connect(config: &Config) -> anyhow::Result<Arc<dyn TaskStore>> {
  let store: Arc<dyn TaskStore> = match config.store_backend {
    StoreBackend::Memory => Arc::new(MemoryTaskStore::new()),
    StoreBackend::Stateless => Arc::new(StatelessTaskStore),
    StoreBackend::Postgres => {
      let url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required for the postgres task store"))?;
      Arc::new(PgTaskStore::new(setup_database(url).await?))
    }
  };
  Ok(store)
}

/// Periodically sweeps expired tasks until the process exits.
pub fn spawn_sweeper(store: Arc<dyn TaskStore>, every: Duration) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(every);
    loop {
      ticker.tick().await;
      match store.cleanup().await {
        Ok(0) => {}
        Ok(removed) => info!(removed, "expired tasks swept"),
        Err(e) => warn!(error = %e, "task sweep failed"),
      }
    }
  })
}
