use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use super::{StoreError, TaskStore};
use crate::models::{now_millis, Lookup, Task, TaskState};

/// Process-local store. Only correct while a single long-lived process
/// serves both submissions and polls.
#[derive(Default)]
pub struct MemoryTaskStore {
  tasks: Mutex<HashMap<String, Task>>,
}

impl MemoryTaskStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
  async fn create(&self, task_id: &str, task: &Task) -> Result<String, StoreError> {
    self.tasks.lock().await.insert(task_id.to_string(), task.clone());
    Ok(task_id.to_string())
  }

  async fn lookup(&self, task_id: &str) -> Result<Lookup, StoreError> {
    let mut tasks = self.tasks.lock().await;
    let Some(task) = tasks.get(task_id) else {
      return Ok(Lookup::Missing);
    };
    if task.is_expired() {
      tasks.remove(task_id);
      info!(task_id, "expired task removed on read");
      return Ok(Lookup::Expired);
    }
    Ok(Lookup::Found(task.clone()))
  }

  async fn update(&self, task_id: &str, next: TaskState) -> Result<String, StoreError> {
    let mut tasks = self.tasks.lock().await;
    let task = tasks
      .get_mut(task_id)
      .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
    *task = task.advance(next).map_err(|t| StoreError::transition(task_id, t))?;
    Ok(task_id.to_string())
  }

  async fn delete(&self, task_id: &str) -> Result<bool, StoreError> {
    Ok(self.tasks.lock().await.remove(task_id).is_some())
  }

  async fn list_ids(&self) -> Result<Vec<String>, StoreError> {
    Ok(self.tasks.lock().await.keys().cloned().collect())
  }

  async fn cleanup(&self) -> Result<u64, StoreError> {
    let now = now_millis();
    let mut tasks = self.tasks.lock().await;
    let before = tasks.len();
    tasks.retain(|_, task| !task.is_expired_at(now));
    Ok((before - tasks.len()) as u64)
  }
}
