//! Hand-off of a created task to whoever runs the orchestration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use lapin::Channel;
use tracing::{error, info};

use crate::messaging::publish_message;
use crate::models::PromptJob;
use crate::orchestrator::Orchestrator;

#[async_trait]
pub trait Dispatcher: Send + Sync {
  /// Returns the task id the caller should poll.
  async fn dispatch(&self, job: PromptJob) -> Result<String>;
}

/// Publishes the job to RabbitMQ for the worker binary.
pub struct QueueDispatcher {
  channel: Channel,
  queue: String,
}

impl QueueDispatcher {
  pub fn new(channel: Channel, queue: impl Into<String>) -> Self {
    Self { channel, queue: queue.into() }
  }
}

#[async_trait]
impl Dispatcher for QueueDispatcher {
  async fn dispatch(&self, job: PromptJob) -> Result<String> {
    let payload = serde_json::to_vec(&job)?;
    publish_message(&self.channel, &self.queue, &payload).await?;
    info!(task_id = %job.task_id, queue = %self.queue, "task published");
    Ok(job.task_id)
  }
}

/// Runs the job on a spawned tokio task inside the API process. Work in
/// flight is lost if the process goes away.
pub struct BackgroundDispatcher {
  orchestrator: Arc<Orchestrator>,
}

impl BackgroundDispatcher {
  pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
    Self { orchestrator }
  }
}

#[async_trait]
impl Dispatcher for BackgroundDispatcher {
  async fn dispatch(&self, job: PromptJob) -> Result<String> {
    let task_id = job.task_id.clone();
    let orchestrator = self.orchestrator.clone();
    tokio::spawn(async move {
      let task_id = job.task_id.clone();
      if let Err(e) = orchestrator.run(job, None).await {
        error!(task_id = %task_id, error = %e, "background task could not record its state");
      }
    });
    Ok(task_id)
  }
}

/// Runs the job to completion before the submission responds. The returned id
/// is the last one the store produced.
pub struct InlineDispatcher {
  orchestrator: Arc<Orchestrator>,
  deadline: Duration,
}

impl InlineDispatcher {
  pub fn new(orchestrator: Arc<Orchestrator>, deadline: Duration) -> Self {
    Self { orchestrator, deadline }
  }
}

#[async_trait]
impl Dispatcher for InlineDispatcher {
  async fn dispatch(&self, job: PromptJob) -> Result<String> {
    Ok(self.orchestrator.run(job, Some(self.deadline)).await?)
  }
}
