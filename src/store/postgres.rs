use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use tracing::{info, warn};
use uuid::Uuid;

use super::{StoreError, TaskStore};
use crate::models::{Lookup, PromptResult, Task, TaskState, TaskStatus, EXPIRY_WINDOW_MS};

/// Shared store backed by the `async_tasks` table.
#[derive(Clone)]
pub struct PgTaskStore {
  pool: PgPool,
}

#[derive(Debug, FromRow)]
struct TaskRow {
  task_id: String,
  status: String,
  result: Option<String>,
  error: Option<String>,
  metadata: String,
  updated_at: DateTime<Utc>,
  expires_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Metadata {
  start_time: i64,
}

/// A row as shown by the dashboard.
#[derive(Debug, Clone)]
pub struct TaskSummary {
  pub task_id: String,
  pub task: Task,
  pub updated_at: DateTime<Utc>,
}

fn corrupt(task_id: &str, reason: impl ToString) -> StoreError {
  StoreError::Corrupt { task_id: task_id.to_string(), reason: reason.to_string() }
}

impl TaskRow {
  fn is_expired(&self, status: TaskStatus) -> bool {
    status.is_terminal() && self.expires_at < Utc::now()
  }

  fn status(&self) -> Result<TaskStatus, StoreError> {
    TaskStatus::from_db_str(&self.status)
      .ok_or_else(|| corrupt(&self.task_id, format!("unknown status {}", self.status)))
  }

  fn into_task(self) -> Result<Task, StoreError> {
    let metadata: Metadata = serde_json::from_str(&self.metadata).map_err(|e| corrupt(&self.task_id, e))?;
    let state = match self.status()? {
      TaskStatus::Pending => TaskState::Pending,
      TaskStatus::Processing => TaskState::Processing,
      TaskStatus::Completed => {
        let raw = self.result.as_deref().ok_or_else(|| corrupt(&self.task_id, "completed without result"))?;
        let result: PromptResult = serde_json::from_str(raw).map_err(|e| corrupt(&self.task_id, e))?;
        TaskState::Completed { result }
      }
      TaskStatus::Failed => TaskState::Failed { error: self.error.unwrap_or_default() },
    };
    Ok(Task { state, start_time: metadata.start_time })
  }
}

fn result_column(task: &Task) -> Result<Option<String>, serde_json::Error> {
  task.state.result().map(serde_json::to_string).transpose()
}

impl PgTaskStore {
  pub fn new(pool: PgPool) -> Self {
    Self { pool }
  }

  async fn fetch(&self, task_id: &str) -> Result<Option<TaskRow>, StoreError> {
    let row = sqlx::query_as::<_, TaskRow>(
      "SELECT task_id, status, result, error, metadata, updated_at, expires_at
       FROM async_tasks WHERE task_id = $1",
    )
      .bind(task_id)
      .fetch_optional(&self.pool)
      .await?;
    Ok(row)
  }

  /// Most recently touched tasks, newest first.
  pub async fn recent(&self, limit: i64) -> Result<Vec<TaskSummary>, StoreError> {
    let rows = sqlx::query_as::<_, TaskRow>(
      "SELECT task_id, status, result, error, metadata, updated_at, expires_at
       FROM async_tasks ORDER BY updated_at DESC LIMIT $1",
    )
      .bind(limit)
      .fetch_all(&self.pool)
      .await?;

    let mut summaries = Vec::with_capacity(rows.len());
    for row in rows {
      let (task_id, updated_at) = (row.task_id.clone(), row.updated_at);
      match row.into_task() {
        Ok(task) => summaries.push(TaskSummary { task_id, task, updated_at }),
        Err(e) => warn!(task_id = %task_id, error = %e, "skipping unreadable task row"),
      }
    }
    Ok(summaries)
  }
}

#[async_trait]
impl TaskStore for PgTaskStore {
  async fn create(&self, task_id: &str, task: &Task) -> Result<String, StoreError> {
    let metadata = serde_json::to_string(&Metadata { start_time: task.start_time }).map_err(|e| corrupt(task_id, e))?;
    let result = result_column(task).map_err(|e| corrupt(task_id, e))?;
    let created_at = Utc
      .timestamp_millis_opt(task.start_time)
      .single()
      .unwrap_or_else(Utc::now);
    let expires_at = created_at + Duration::milliseconds(EXPIRY_WINDOW_MS);

    sqlx::query(
      "INSERT INTO async_tasks (id, task_id, status, result, error, metadata, created_at, updated_at, expires_at)
       VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), $8)",
    )
      .bind(Uuid::new_v4())
      .bind(task_id)
      .bind(task.status().as_db_str())
      .bind(result)
      .bind(task.state.error())
      .bind(metadata)
      .bind(created_at)
      .bind(expires_at)
      .execute(&self.pool)
      .await?;

    info!(task_id, "task created in database");
    Ok(task_id.to_string())
  }

  async fn lookup(&self, task_id: &str) -> Result<Lookup, StoreError> {
    let Some(row) = self.fetch(task_id).await? else {
      return Ok(Lookup::Missing);
    };
    if row.is_expired(row.status()?) {
      info!(task_id, "task has expired, deleting");
      self.delete(task_id).await?;
      return Ok(Lookup::Expired);
    }
    Ok(Lookup::Found(row.into_task()?))
  }

  async fn update(&self, task_id: &str, next: TaskState) -> Result<String, StoreError> {
    let mut tx = self.pool.begin().await?;

    let row = sqlx::query_as::<_, TaskRow>(
      "SELECT task_id, status, result, error, metadata, updated_at, expires_at
       FROM async_tasks WHERE task_id = $1 FOR UPDATE",
    )
      .bind(task_id)
      .fetch_optional(&mut *tx)
      .await?
      .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;

    let task = row
      .into_task()?
      .advance(next)
      .map_err(|t| StoreError::transition(task_id, t))?;
    let result = result_column(&task).map_err(|e| corrupt(task_id, e))?;

    sqlx::query("UPDATE async_tasks SET status = $1, result = $2, error = $3, updated_at = NOW() WHERE task_id = $4")
      .bind(task.status().as_db_str())
      .bind(result)
      .bind(task.state.error())
      .bind(task_id)
      .execute(&mut *tx)
      .await?;
    tx.commit().await?;

    info!(task_id, status = %task.status(), "task updated in database");
    Ok(task_id.to_string())
  }

  async fn delete(&self, task_id: &str) -> Result<bool, StoreError> {
    let deleted = sqlx::query("DELETE FROM async_tasks WHERE task_id = $1")
      .bind(task_id)
      .execute(&self.pool)
      .await?;
    Ok(deleted.rows_affected() > 0)
  }

  async fn list_ids(&self) -> Result<Vec<String>, StoreError> {
    let ids = sqlx::query_scalar::<_, String>(
      "SELECT task_id FROM async_tasks
       WHERE NOT (expires_at < NOW() AND status IN ('COMPLETED', 'FAILED'))
       ORDER BY created_at",
    )
      .fetch_all(&self.pool)
      .await?;
    Ok(ids)
  }

  async fn cleanup(&self) -> Result<u64, StoreError> {
    let swept = sqlx::query("DELETE FROM async_tasks WHERE expires_at < NOW() AND status IN ('COMPLETED', 'FAILED')")
      .execute(&self.pool)
      .await?;
    Ok(swept.rows_affected())
  }
}
