use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use imgprompt::config::{Config, DispatchMode};
use imgprompt::dispatch::{BackgroundDispatcher, Dispatcher, InlineDispatcher, QueueDispatcher};
use imgprompt::messaging::{create_rabbit_channel, declare_task_queue, enable_publisher_confirms};
use imgprompt::orchestrator::Orchestrator;
use imgprompt::routes::{routes, AppState};
use imgprompt::store;
use imgprompt::telemetry::init_tracing;
use imgprompt::upstream::{CozeClient, PromptUpstream};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  init_tracing();
  let config = Config::from_env()?;
  let task_store = store::connect(&config).await?;

  let upstream: Arc<dyn PromptUpstream> = Arc::new(CozeClient::new(config.upstream.clone()));
  if let Err(e) = upstream.ensure_configured() {
    warn!(error = %e, hint = e.hint(), "upstream not configured; submissions will be rejected");
  }
  let orchestrator = Arc::new(Orchestrator::new(task_store.clone(), upstream));

  let dispatcher: Arc<dyn Dispatcher> = match config.dispatch_mode {
    DispatchMode::Queue => {
      let url = config.rabbitmq_url.as_deref().context("RABBITMQ_URL is required for queue dispatch")?;
      let channel = create_rabbit_channel(url).await?;
      enable_publisher_confirms(&channel).await?;
      declare_task_queue(&channel, &config.task_queue).await?;
      Arc::new(QueueDispatcher::new(channel, config.task_queue.clone()))
    }
    DispatchMode::Background => {
      warn!("background dispatch runs tasks inside the API process; in-flight tasks are lost on restart");
      Arc::new(BackgroundDispatcher::new(orchestrator.clone()))
    }
    DispatchMode::Inline => Arc::new(InlineDispatcher::new(orchestrator.clone(), config.inline_deadline)),
  };

  store::spawn_sweeper(task_store, config.cleanup_interval);

  let state = AppState {
    orchestrator,
    dispatcher,
    public_app_url: config.public_app_url.clone(),
    max_upload_bytes: config.max_upload_bytes,
  };

  info!(
    port = config.server_port,
    store = ?config.store_backend,
    dispatch = ?config.dispatch_mode,
    "imgprompt api listening"
  );
  warp::serve(routes(state))
    .run(([0, 0, 0, 0], config.server_port))
    .await;
  Ok(())
}
