//! Client for the workflow service that turns an uploaded image into a prompt.
//!
//! Two calls per conversion: a multipart upload that yields a file id, then a
//! streaming workflow run whose event-stream body is returned untouched. Each
//! call has its own timeout and is never retried.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::UpstreamConfig;
use crate::models::ImageUpload;

/// Value shipped in sample env files; treated the same as no token.
pub const PLACEHOLDER_TOKEN: &str = "your-coze-api-token-here";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
  #[error("API configuration missing. Please configure COZE_API_TOKEN.")]
  MissingToken,

  #[error("API configuration missing. Please configure COZE_WORKFLOW_ID.")]
  MissingWorkflowId,
}

impl ConfigurationError {
  pub fn hint(&self) -> &'static str {
    match self {
      ConfigurationError::MissingToken => "COZE_API_TOKEN is required for image-to-prompt functionality",
      ConfigurationError::MissingWorkflowId => "COZE_WORKFLOW_ID is required for workflow execution",
    }
  }
}

#[derive(Debug, Error)]
pub enum UpstreamError {
  #[error(transparent)]
  Configuration(#[from] ConfigurationError),

  #[error("File upload failed: {body}")]
  Upload { status: StatusCode, body: String },

  #[error("No file ID returned from upload: {body}")]
  MissingFileId { status: StatusCode, body: String },

  #[error("Workflow execution failed: {body}")]
  Workflow { status: StatusCode, body: String },

  #[error("HTTP {}: {}", .status.as_u16(), .body)]
  Unreachable { status: StatusCode, body: String },

  #[error("upstream request failed: {0}")]
  Transport(#[from] reqwest::Error),
}

/// Credential presence as shown by the diagnostics endpoint. Never carries the token.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialView {
  pub has_coze_token: bool,
  pub coze_token_length: usize,
  pub has_workflow_id: bool,
  pub workflow_id: String,
}

impl CredentialView {
  pub fn of(config: &UpstreamConfig) -> Self {
    let token = config.api_token.as_deref().filter(|t| *t != PLACEHOLDER_TOKEN);
    let workflow_id = match config.workflow_id.as_deref() {
      Some(id) => format!("{}...", id.chars().take(10).collect::<String>()),
      None => "not set".to_string(),
    };
    Self {
      has_coze_token: token.is_some(),
      coze_token_length: token.map_or(0, str::len),
      has_workflow_id: config.workflow_id.is_some(),
      workflow_id,
    }
  }
}

#[async_trait]
pub trait PromptUpstream: Send + Sync {
  /// Fails fast when credentials are missing, before any network call.
  fn ensure_configured(&self) -> Result<(), ConfigurationError>;

  async fn upload(&self, image: &ImageUpload) -> Result<String, UpstreamError>;

  /// Returns the raw event-stream body of the workflow run.
  async fn run_workflow(&self, file_id: &str, style_preference: &str) -> Result<String, UpstreamError>;

  fn credentials_view(&self) -> CredentialView;

  /// Cheap authenticated call that uploads nothing.
  async fn check_reachable(&self) -> Result<(), UpstreamError>;
}

pub struct CozeClient {
  client: Client,
  config: UpstreamConfig,
}

impl CozeClient {
  pub fn new(config: UpstreamConfig) -> Self {
    Self { client: Client::new(), config }
  }

  fn token(&self) -> Result<&str, ConfigurationError> {
    self
      .config
      .api_token
      .as_deref()
      .filter(|t| *t != PLACEHOLDER_TOKEN)
      .ok_or(ConfigurationError::MissingToken)
  }

  fn credentials(&self) -> Result<(&str, &str), ConfigurationError> {
    let token = self.token()?;
    let workflow_id = self
      .config
      .workflow_id
      .as_deref()
      .ok_or(ConfigurationError::MissingWorkflowId)?;
    Ok((token, workflow_id))
  }
}

/// Body of the workflow run request. The workflow declares its style input as
/// `style_preferenc`, and the image input as a JSON string holding the file id.
pub fn workflow_payload(workflow_id: &str, file_id: &str, style_preference: &str) -> Value {
  json!({
    "workflow_id": workflow_id,
    "parameters": {
      "image": json!({ "file_id": file_id }).to_string(),
      "style_preferenc": style_preference,
      "user_query": "",
    }
  })
}

fn file_id_of(body: &str) -> Option<String> {
  let parsed: Value = serde_json::from_str(body).ok()?;
  match parsed.pointer("/data/id")? {
    Value::String(id) if !id.is_empty() => Some(id.clone()),
    Value::Number(id) => Some(id.to_string()),
    _ => None,
  }
}

#[async_trait]
impl PromptUpstream for CozeClient {
  fn ensure_configured(&self) -> Result<(), ConfigurationError> {
    self.credentials().map(|_| ())
  }

  async fn upload(&self, image: &ImageUpload) -> Result<String, UpstreamError> {
    let (token, _) = self.credentials()?;
    let part = Part::bytes(image.bytes.clone())
      .file_name(image.filename.clone())
      .mime_str(&image.content_type)?;

    let response = self
      .client
      .post(format!("{}/v1/files/upload", self.config.base_url))
      .bearer_auth(token)
      .multipart(Form::new().part("file", part))
      .timeout(self.config.upload_timeout)
      .send()
      .await?;

    let status = response.status();
    let body = response.text().await?;
    debug!(%status, body = %body, "upload response");
    if !status.is_success() {
      return Err(UpstreamError::Upload { status, body });
    }

    let file_id = file_id_of(&body).ok_or(UpstreamError::MissingFileId { status, body })?;
    info!(file_id = %file_id, size = image.bytes.len(), "image uploaded");
    Ok(file_id)
  }

  async fn run_workflow(&self, file_id: &str, style_preference: &str) -> Result<String, UpstreamError> {
    let (token, workflow_id) = self.credentials()?;
    let response = self
      .client
      .post(format!("{}/v1/workflow/stream_run", self.config.base_url))
      .bearer_auth(token)
      .json(&workflow_payload(workflow_id, file_id, style_preference))
      .timeout(self.config.workflow_timeout)
      .send()
      .await?;

    let status = response.status();
    let body = response.text().await?;
    debug!(%status, body = %body, "workflow response");
    if !status.is_success() {
      return Err(UpstreamError::Workflow { status, body });
    }
    Ok(body)
  }

  fn credentials_view(&self) -> CredentialView {
    CredentialView::of(&self.config)
  }

  async fn check_reachable(&self) -> Result<(), UpstreamError> {
    let token = self.token()?;
    let response = self
      .client
      .get(format!("{}/v1/workspace/list", self.config.base_url))
      .bearer_auth(token)
      .timeout(self.config.upload_timeout)
      .send()
      .await?;

    let status = response.status();
    if status.is_success() {
      return Ok(());
    }
    let body = response.text().await?;
    debug!(%status, body = %body, "connectivity check rejected");
    Err(UpstreamError::Unreachable { status, body })
  }
}
