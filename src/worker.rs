use std::sync::Arc;

use anyhow::{bail, Context};
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions};
use lapin::types::FieldTable;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use imgprompt::config::{Config, StoreBackend};
use imgprompt::messaging::{create_rabbit_channel, declare_task_queue};
use imgprompt::models::PromptJob;
use imgprompt::orchestrator::Orchestrator;
use imgprompt::store;
use imgprompt::telemetry::init_tracing;
use imgprompt::upstream::{CozeClient, PromptUpstream};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  init_tracing();
  let config = Config::from_env()?;
  if config.store_backend != StoreBackend::Postgres {
    bail!("the worker needs the shared postgres task store; set DATABASE_URL");
  }
  let rabbitmq_url = config.rabbitmq_url.as_deref().context("RABBITMQ_URL is required for the worker")?;

  let upstream = CozeClient::new(config.upstream.clone());
  upstream.ensure_configured().map_err(|e| anyhow::anyhow!("{} ({})", e, e.hint()))?;

  let task_store = store::connect(&config).await?;
  let orchestrator = Arc::new(Orchestrator::new(task_store.clone(), Arc::new(upstream)));
  store::spawn_sweeper(task_store, config.cleanup_interval);

  let channel = create_rabbit_channel(rabbitmq_url).await?;
  let backlog = declare_task_queue(&channel, &config.task_queue).await?;
  channel
    .basic_qos(config.worker_concurrency.min(u16::MAX as usize) as u16, BasicQosOptions::default())
    .await?;
  let mut consumer = channel
    .basic_consume(&config.task_queue, &config.worker_id, BasicConsumeOptions::default(), FieldTable::default())
    .await
    .context("Failed to start consumer")?;
  info!(worker_id = %config.worker_id, queue = %config.task_queue, backlog, "worker consuming");

  let semaphore = Arc::new(Semaphore::new(config.worker_concurrency));
  while let Some(delivery) = consumer.next().await {
    let delivery = match delivery {
      Ok(delivery) => delivery,
      Err(e) => {
        error!(error = ?e, "consumer error");
        continue;
      }
    };
    let permit = semaphore.clone().acquire_owned().await?;
    let orchestrator = orchestrator.clone();
    tokio::spawn(async move {
      handle_delivery(&orchestrator, delivery).await;
      drop(permit);
    });
  }

  warn!("consumer stream closed, worker exiting");
  Ok(())
}

/// Acks once the outcome is stored. A store failure is requeued once so that
/// a second worker can retry; a payload that does not parse is dropped.
async fn handle_delivery(orchestrator: &Orchestrator, delivery: Delivery) {
  let job = match serde_json::from_slice::<PromptJob>(&delivery.data) {
    Ok(job) => job,
    Err(e) => {
      error!(error = %e, "dropping unreadable job");
      if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
        error!(error = ?e, "ack failed");
      }
      return;
    }
  };

  let task_id = job.task_id.clone();
  match orchestrator.run(job, None).await {
    Ok(_) => {
      if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
        error!(task_id = %task_id, error = ?e, "ack failed");
      }
    }
    Err(e) => {
      let requeue = !delivery.redelivered;
      error!(task_id = %task_id, error = %e, requeue, "could not record task outcome");
      if let Err(e) = delivery.nack(BasicNackOptions { requeue, ..Default::default() }).await {
        error!(task_id = %task_id, error = ?e, "nack failed");
      }
    }
  }
}
