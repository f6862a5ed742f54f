use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
  Memory,
  Postgres,
  Stateless,
}

impl FromStr for StoreBackend {
  type Err = anyhow::Error;

  fn from_str(raw: &str) -> Result<Self> {
    match raw.trim().to_ascii_lowercase().as_str() {
      "memory" => Ok(StoreBackend::Memory),
      "postgres" => Ok(StoreBackend::Postgres),
      "stateless" => Ok(StoreBackend::Stateless),
      other => bail!("unknown TASK_STORE '{}'", other),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
  Queue,
  Background,
  Inline,
}

impl FromStr for DispatchMode {
  type Err = anyhow::Error;

  fn from_str(raw: &str) -> Result<Self> {
    match raw.trim().to_ascii_lowercase().as_str() {
      "queue" => Ok(DispatchMode::Queue),
      "background" => Ok(DispatchMode::Background),
      "inline" => Ok(DispatchMode::Inline),
      other => bail!("unknown DISPATCH_MODE '{}'", other),
    }
  }
}

/// Settings for the image-to-prompt workflow service.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
  pub api_token: Option<String>,
  pub workflow_id: Option<String>,
  pub base_url: String,
  pub upload_timeout: Duration,
  pub workflow_timeout: Duration,
}

impl Default for UpstreamConfig {
  fn default() -> Self {
    Self {
      api_token: None,
      workflow_id: None,
      base_url: "https://api.coze.cn".into(),
      upload_timeout: Duration::from_secs(60),
      workflow_timeout: Duration::from_secs(240),
    }
  }
}

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: Option<String>,
  pub rabbitmq_url: Option<String>,
  pub server_port: u16,
  pub store_backend: StoreBackend,
  pub dispatch_mode: DispatchMode,
  pub task_queue: String,
  pub worker_id: String,
  pub worker_concurrency: usize,
  pub public_app_url: Option<String>,
  pub inline_deadline: Duration,
  pub cleanup_interval: Duration,
  pub max_upload_bytes: u64,
  pub upstream: UpstreamConfig,
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  /// Builds the config from any key lookup; empty values count as unset.
  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    let secs = |key: &str, default: u64| -> Result<Duration> {
      Ok(Duration::from_secs(parse_or(get(key), key, default)?))
    };

    let database_url = get("DATABASE_URL");
    let store_backend = match get("TASK_STORE") {
      Some(raw) => raw.parse()?,
      None if database_url.is_some() => StoreBackend::Postgres,
      None => StoreBackend::Memory,
    };
    let dispatch_mode = match get("DISPATCH_MODE") {
      Some(raw) => raw.parse()?,
      None => match store_backend {
        StoreBackend::Postgres => DispatchMode::Queue,
        StoreBackend::Memory => DispatchMode::Background,
        StoreBackend::Stateless => DispatchMode::Inline,
      },
    };

    let defaults = UpstreamConfig::default();
    let config = Self {
      database_url,
      rabbitmq_url: get("RABBITMQ_URL"),
      server_port: parse_or(get("SERVER_PORT"), "SERVER_PORT", 8080)?,
      store_backend,
      dispatch_mode,
      task_queue: get("TASK_QUEUE").unwrap_or_else(|| "image_prompt_queue".into()),
      worker_id: get("WORKER_ID").unwrap_or_else(|| "worker".into()),
      worker_concurrency: parse_or(get("WORKER_CONCURRENCY"), "WORKER_CONCURRENCY", 4)?,
      public_app_url: get("PUBLIC_APP_URL").map(|url| url.trim_end_matches('/').to_string()),
      inline_deadline: secs("INLINE_DEADLINE_SECS", 300)?,
      cleanup_interval: secs("CLEANUP_INTERVAL_SECS", 300)?,
      max_upload_bytes: parse_or(get("MAX_UPLOAD_BYTES"), "MAX_UPLOAD_BYTES", 10 * 1024 * 1024)?,
      upstream: UpstreamConfig {
        api_token: get("COZE_API_TOKEN"),
        workflow_id: get("COZE_WORKFLOW_ID"),
        base_url: get("COZE_BASE_URL")
          .map(|url| url.trim_end_matches('/').to_string())
          .unwrap_or(defaults.base_url),
        upload_timeout: secs("UPLOAD_TIMEOUT_SECS", defaults.upload_timeout.as_secs())?,
        workflow_timeout: secs("WORKFLOW_TIMEOUT_SECS", defaults.workflow_timeout.as_secs())?,
      },
    };
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    match (self.store_backend, self.dispatch_mode) {
      (StoreBackend::Stateless, DispatchMode::Queue | DispatchMode::Background) => {
        bail!("the stateless task store only works with DISPATCH_MODE=inline")
      }
      (StoreBackend::Memory, DispatchMode::Queue) => {
        bail!("DISPATCH_MODE=queue needs a store the worker can reach; use TASK_STORE=postgres")
      }
      _ => {}
    }
    if self.dispatch_mode == DispatchMode::Queue && self.rabbitmq_url.is_none() {
      bail!("RABBITMQ_URL is required when DISPATCH_MODE=queue");
    }
    if self.store_backend == StoreBackend::Postgres && self.database_url.is_none() {
      bail!("DATABASE_URL is required when TASK_STORE=postgres");
    }
    if self.worker_concurrency == 0 {
      bail!("WORKER_CONCURRENCY must be at least 1");
    }
    Ok(())
  }
}

fn parse_or<T: FromStr>(raw: Option<String>, key: &str, default: T) -> Result<T> {
  match raw {
    None => Ok(default),
    Some(value) => value
      .parse()
      .map_err(|_| anyhow::anyhow!("{} has an invalid value '{}'", key, value)),
  }
}
