use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal tasks are kept for one hour after they were started.
pub const EXPIRY_WINDOW_MS: i64 = 60 * 60 * 1000;

pub const DEFAULT_STYLE: &str = "detailed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
  Pending,
  Processing,
  Completed,
  Failed,
}

impl TaskStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, TaskStatus::Completed | TaskStatus::Failed)
  }

  /// Forward-only: pending -> processing -> completed | failed. Staying in the
  /// same non-terminal state is allowed so redelivered jobs can re-mark it.
  pub fn can_advance_to(self, next: TaskStatus) -> bool {
    if self.is_terminal() {
      return false;
    }
    if self == next {
      return true;
    }
    match (self, next) {
      (TaskStatus::Pending, TaskStatus::Processing) => true,
      (TaskStatus::Processing, n) => n.is_terminal(),
      _ => false,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      TaskStatus::Pending => "pending",
      TaskStatus::Processing => "processing",
      TaskStatus::Completed => "completed",
      TaskStatus::Failed => "failed",
    }
  }

  /// Column representation used by the postgres store.
  pub fn as_db_str(self) -> &'static str {
    match self {
      TaskStatus::Pending => "PENDING",
      TaskStatus::Processing => "PROCESSING",
      TaskStatus::Completed => "COMPLETED",
      TaskStatus::Failed => "FAILED",
    }
  }

  pub fn from_db_str(raw: &str) -> Option<Self> {
    match raw.to_ascii_uppercase().as_str() {
      "PENDING" => Some(TaskStatus::Pending),
      "PROCESSING" => Some(TaskStatus::Processing),
      "COMPLETED" => Some(TaskStatus::Completed),
      "FAILED" => Some(TaskStatus::Failed),
      _ => None,
    }
  }
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResult {
  pub prompt: String,
  pub file_id: String,
}

/// Status plus the data that only exists in that status, so a task can never
/// carry both a result and an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TaskState {
  Pending,
  Processing,
  Completed { result: PromptResult },
  Failed { error: String },
}

impl TaskState {
  pub fn status(&self) -> TaskStatus {
    match self {
      TaskState::Pending => TaskStatus::Pending,
      TaskState::Processing => TaskStatus::Processing,
      TaskState::Completed { .. } => TaskStatus::Completed,
      TaskState::Failed { .. } => TaskStatus::Failed,
    }
  }

  pub fn result(&self) -> Option<&PromptResult> {
    match self {
      TaskState::Completed { result } => Some(result),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      TaskState::Failed { error } => Some(error),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
  #[serde(flatten)]
  pub state: TaskState,
  /// Epoch milliseconds; never changes after creation.
  pub start_time: i64,
}

impl Task {
  pub fn pending(start_time: i64) -> Self {
    Self { state: TaskState::Pending, start_time }
  }

  pub fn status(&self) -> TaskStatus {
    self.state.status()
  }

  pub fn expires_at(&self) -> i64 {
    self.start_time + EXPIRY_WINDOW_MS
  }

  pub fn is_expired_at(&self, now_ms: i64) -> bool {
    self.status().is_terminal() && now_ms > self.expires_at()
  }

  pub fn is_expired(&self) -> bool {
    self.is_expired_at(now_millis())
  }

  /// Returns the task in its next state, or the rejected transition.
  pub fn advance(&self, next: TaskState) -> Result<Task, (TaskStatus, TaskStatus)> {
    let (from, to) = (self.status(), next.status());
    if !from.can_advance_to(to) {
      return Err((from, to));
    }
    Ok(Task { state: next, start_time: self.start_time })
  }
}

/// What a store read found for an identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
  Found(Task),
  Expired,
  Missing,
}

impl Lookup {
  pub fn into_task(self) -> Option<Task> {
    match self {
      Lookup::Found(task) => Some(task),
      Lookup::Expired | Lookup::Missing => None,
    }
  }
}

/// Reply body of the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
  pub task_id: String,
  pub status: TaskStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub result: Option<PromptResult>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  pub elapsed_time: i64,
}

impl TaskView {
  pub fn new(task_id: &str, task: &Task, now_ms: i64) -> Self {
    Self {
      task_id: task_id.to_string(),
      status: task.status(),
      result: task.state.result().cloned(),
      error: task.state.error().map(str::to_string),
      elapsed_time: (now_ms - task.start_time).max(0),
    }
  }
}

/// Image bytes as received from the client, kept around until upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUpload {
  pub filename: String,
  pub content_type: String,
  #[serde(with = "base64_bytes")]
  pub bytes: Vec<u8>,
}

/// Unit of work handed from the API to whoever runs the orchestration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptJob {
  pub task_id: String,
  pub style_preference: String,
  pub image: ImageUpload,
}

pub fn now_millis() -> i64 {
  Utc::now().timestamp_millis()
}

pub fn new_task_id() -> String {
  let random = Uuid::new_v4().simple().to_string();
  format!("task_{}_{}", now_millis(), &random[..12])
}

mod base64_bytes {
  use base64::Engine;
  use base64::engine::general_purpose::STANDARD;
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD.decode(encoded).map_err(serde::de::Error::custom)
  }
}
