//! Identifier-as-storage backend.
//!
//! The whole task payload travels base64url-encoded inside the id
//! (`task_<millis>_<random>_<payload>`). Nothing is stored server side, so every
//! update mints a new id and older ids keep decoding to their own snapshot.
//! Anyone holding an id can read the full task, result included.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use super::{StoreError, TaskStore};
use crate::models::{new_task_id, Lookup, Task, TaskState};

#[derive(Debug, Clone, Copy, Default)]
pub struct StatelessTaskStore;

/// Appends the encoded payload to the `task_<millis>_<random>` prefix.
pub fn encode_task_id(prefix: &str, task: &Task) -> Result<String, StoreError> {
  let json = serde_json::to_vec(task).map_err(|e| StoreError::Corrupt {
    task_id: prefix.to_string(),
    reason: e.to_string(),
  })?;
  Ok(format!("{}_{}", prefix, URL_SAFE_NO_PAD.encode(json)))
}

/// Splits an id into its prefix and decoded payload. The payload may itself
/// contain `_`, so only the first three separators count.
pub fn decode_task_id(task_id: &str) -> Option<(String, Task)> {
  let mut parts = task_id.splitn(4, '_');
  let (tag, millis, random, payload) = (parts.next()?, parts.next()?, parts.next()?, parts.next()?);
  if tag != "task" || millis.parse::<i64>().is_err() || random.is_empty() {
    return None;
  }
  let raw = URL_SAFE_NO_PAD.decode(payload).ok()?;
  let task = serde_json::from_slice::<Task>(&raw).ok()?;
  Some((format!("{tag}_{millis}_{random}"), task))
}

#[async_trait]
impl TaskStore for StatelessTaskStore {
  async fn create(&self, task_id: &str, task: &Task) -> Result<String, StoreError> {
    encode_task_id(task_id, task)
  }

  async fn lookup(&self, task_id: &str) -> Result<Lookup, StoreError> {
    Ok(match decode_task_id(task_id) {
      None => Lookup::Missing,
      Some((_, task)) if task.is_expired() => Lookup::Expired,
      Some((_, task)) => Lookup::Found(task),
    })
  }

  async fn update(&self, task_id: &str, next: TaskState) -> Result<String, StoreError> {
    let (prefix, task) = decode_task_id(task_id).ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
    let advanced = task.advance(next).map_err(|t| StoreError::transition(&prefix, t))?;
    encode_task_id(&new_task_id(), &advanced)
  }

  async fn delete(&self, _task_id: &str) -> Result<bool, StoreError> {
    Ok(false)
  }

  async fn list_ids(&self) -> Result<Vec<String>, StoreError> {
    Ok(Vec::new())
  }

  async fn cleanup(&self) -> Result<u64, StoreError> {
    Ok(0)
  }
}
