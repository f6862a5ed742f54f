use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::dispatch::Dispatcher;
use crate::extract::{extract_prompt, WorkflowFailure};
use crate::models::{new_task_id, now_millis, ImageUpload, PromptJob, PromptResult, Task, TaskState};
use crate::store::{StoreError, TaskStore};
use crate::upstream::{PromptUpstream, UpstreamError};

#[derive(Debug, Error)]
pub enum PipelineError {
  #[error(transparent)]
  Upstream(#[from] UpstreamError),

  #[error(transparent)]
  Workflow(#[from] WorkflowFailure),

  #[error("Task timed out after {0:?}")]
  TimedOut(Duration),

  #[error("Task aborted unexpectedly: {0}")]
  Panicked(String),
}

#[derive(Debug, Error)]
pub enum SubmitError {
  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("Failed to start async task: {0}")]
  Dispatch(anyhow::Error),
}

/// Drives one task from pending to a terminal state.
pub struct Orchestrator {
  store: Arc<dyn TaskStore>,
  upstream: Arc<dyn PromptUpstream>,
}

impl Orchestrator {
  pub fn new(store: Arc<dyn TaskStore>, upstream: Arc<dyn PromptUpstream>) -> Self {
    Self { store, upstream }
  }

  pub fn store(&self) -> &Arc<dyn TaskStore> {
    &self.store
  }

  pub fn upstream(&self) -> &Arc<dyn PromptUpstream> {
    &self.upstream
  }

  /// Stores a pending task and hands it to `dispatcher`. Returns the id the
  /// caller should poll. If the hand-off fails the pending task is removed.
  pub async fn submit(
    &self,
    dispatcher: &dyn Dispatcher,
    image: ImageUpload,
    style_preference: String,
  ) -> Result<String, SubmitError> {
    let task_id = self.store.create(&new_task_id(), &Task::pending(now_millis())).await?;
    info!(task_id = %task_id, style = %style_preference, "task created");

    let job = PromptJob { task_id: task_id.clone(), style_preference, image };
    match dispatcher.dispatch(job).await {
      Ok(poll_id) => Ok(poll_id),
      Err(e) => {
        error!(task_id = %task_id, error = ?e, "failed to dispatch task");
        if let Err(cleanup) = self.store.delete(&task_id).await {
          warn!(task_id = %task_id, error = %cleanup, "failed to remove undispatched task");
        }
        Err(SubmitError::Dispatch(e))
      }
    }
  }

  /// Runs the conversion and records its outcome. Upstream failures, timeouts
  /// and panics end as `failed`; only store errors are returned.
  pub async fn run(&self, job: PromptJob, deadline: Option<Duration>) -> Result<String, StoreError> {
    let task_id = job.task_id.clone();
    if let Some(task) = self.store.get(&task_id).await? {
      if task.status().is_terminal() {
        info!(task_id = %task_id, status = %task.status(), "task already finished, skipping");
        return Ok(task_id);
      }
    }

    let task_id = self.store.update(&task_id, TaskState::Processing).await?;
    info!(task_id = %task_id, "processing started");

    let pipeline = AssertUnwindSafe(self.convert(&job)).catch_unwind();
    let outcome = match deadline {
      Some(limit) => match tokio::time::timeout(limit, pipeline).await {
        Ok(caught) => flatten_panic(caught),
        Err(_) => Err(PipelineError::TimedOut(limit)),
      },
      None => flatten_panic(pipeline.await),
    };

    let next = match outcome {
      Ok(result) => {
        info!(task_id = %task_id, file_id = %result.file_id, "task completed");
        TaskState::Completed { result }
      }
      Err(e) => {
        warn!(task_id = %task_id, error = %e, "task failed");
        TaskState::Failed { error: e.to_string() }
      }
    };
    self.store.update(&task_id, next).await
  }

  async fn convert(&self, job: &PromptJob) -> Result<PromptResult, PipelineError> {
    let file_id = self.upstream.upload(&job.image).await?;
    let body = self.upstream.run_workflow(&file_id, &job.style_preference).await?;
    let prompt = extract_prompt(&body)?;
    Ok(PromptResult { prompt, file_id })
  }
}

fn flatten_panic(
  caught: Result<Result<PromptResult, PipelineError>, Box<dyn Any + Send>>,
) -> Result<PromptResult, PipelineError> {
  caught.unwrap_or_else(|panic| {
    let message = panic
      .downcast_ref::<&str>()
      .map(|s| s.to_string())
      .or_else(|| panic.downcast_ref::<String>().cloned())
      .unwrap_or_else(|| "unknown panic".to_string());
    Err(PipelineError::Panicked(message))
  })
}
