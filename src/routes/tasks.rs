use std::sync::LazyLock;

use bytes::BufMut;
use futures::TryStreamExt;
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};
use warp::multipart::{FormData, Part};
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use super::{with_state, AppState};
use crate::error::ApiError;
use crate::models::{now_millis, ImageUpload, Lookup, TaskView, DEFAULT_STYLE};
use crate::orchestrator::SubmitError;

static STYLE_PATTERN: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^[\w\s.,\-]{1,64}$").expect("style pattern compiles"));

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
  pub success: bool,
  pub task_id: String,
  pub message: String,
  pub status_url: String,
}

fn sanitize_style(raw: Option<String>) -> Result<String, ApiError> {
  let style = raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
  match style {
    None => Ok(DEFAULT_STYLE.to_string()),
    Some(style) if STYLE_PATTERN.is_match(&style) => Ok(style),
    Some(_) => Err(ApiError::Validation("Invalid style_preference".into())),
  }
}

fn respond(result: Result<Response, ApiError>) -> Result<Response, Rejection> {
  Ok(result.unwrap_or_else(Reply::into_response))
}

pub fn submit_route(state: AppState) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
  let max_length = state.max_upload_bytes;
  warp::path!("tasks")
    .and(warp::post())
    .and(with_state(state))
    .and(warp::multipart::form().max_length(max_length))
    .and_then(|state, form| async move { respond(submit_task(state, form).await) })
}

pub fn status_route(state: AppState) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
  warp::path!("tasks" / String)
    .and(warp::get())
    .and(with_state(state))
    .and_then(|task_id, state| async move { respond(task_status(task_id, state).await) })
}

pub fn missing_id_route() -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
  warp::path!("tasks")
    .and(warp::get())
    .and_then(|| async { respond(Err(ApiError::Validation("Task ID is required".into()))) })
}

async fn read_part(part: Part) -> Result<Vec<u8>, ApiError> {
  part
    .stream()
    .try_fold(Vec::new(), |mut acc, chunk| async move {
      acc.put(chunk);
      Ok(acc)
    })
    .await
    .map_err(|e| ApiError::Validation(format!("Failed to read upload: {}", e)))
}

async fn read_form(mut form: FormData) -> Result<(Option<ImageUpload>, Option<String>), ApiError> {
  let mut image = None;
  let mut style = None;

  while let Some(part) = form
    .try_next()
    .await
    .map_err(|e| ApiError::Validation(format!("Malformed multipart body: {}", e)))?
  {
    let name = part.name().to_string();
    match name.as_str() {
      "image" => {
        let filename = part.filename().unwrap_or("image").to_string();
        let content_type = part.content_type().unwrap_or("application/octet-stream").to_string();
        let bytes = read_part(part).await?;
        if !bytes.is_empty() {
          image = Some(ImageUpload { filename, content_type, bytes });
        }
      }
      "style_preference" => {
        let raw = read_part(part).await?;
        style = Some(String::from_utf8_lossy(&raw).into_owned());
      }
      _ => {}
    }
  }
  Ok((image, style))
}

async fn submit_task(state: AppState, form: FormData) -> Result<Response, ApiError> {
  state.orchestrator.upstream().ensure_configured()?;

  let (image, style) = read_form(form).await?;
  let image = image.ok_or_else(|| ApiError::Validation("No image file provided".into()))?;
  let style = sanitize_style(style)?;
  info!(filename = %image.filename, size = image.bytes.len(), style = %style, "image received");

  let task_id = state
    .orchestrator
    .submit(state.dispatcher.as_ref(), image, style)
    .await
    .map_err(|e| match e {
      SubmitError::Store(e) => ApiError::Store(e),
      SubmitError::Dispatch(e) => ApiError::Internal {
        message: e.to_string(),
        details: "Failed to start async task".into(),
      },
    })?;

  let response = SubmitResponse {
    success: true,
    status_url: state.status_url(&task_id),
    task_id,
    message: "Task started. Use the taskId to check status.".into(),
  };
  Ok(warp::reply::json(&response).into_response())
}

async fn task_status(task_id: String, state: AppState) -> Result<Response, ApiError> {
  let task_id = task_id.trim();
  if task_id.is_empty() {
    return Err(ApiError::Validation("Task ID is required".into()));
  }

  let store = state.orchestrator.store();
  match store.lookup(task_id).await? {
    Lookup::Found(task) => Ok(warp::reply::json(&TaskView::new(task_id, &task, now_millis())).into_response()),
    Lookup::Expired => Err(ApiError::Expired),
    Lookup::Missing => {
      let available = store.list_ids().await.unwrap_or_else(|e| {
        warn!(error = %e, "could not enumerate tasks");
        Vec::new()
      });
      info!(task_id, known = available.len(), "task not found");
      Err(ApiError::NotFound { available })
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn style_defaults_and_validation() {
    assert_eq!(sanitize_style(None).unwrap(), "detailed");
    assert_eq!(sanitize_style(Some("  ".into())).unwrap(), "detailed");
    assert_eq!(sanitize_style(Some(" flux ".into())).unwrap(), "flux");
    assert_eq!(sanitize_style(Some("midjourney v6, cinematic".into())).unwrap(), "midjourney v6, cinematic");
    assert!(sanitize_style(Some("<script>".into())).is_err());
    assert!(sanitize_style(Some("x".repeat(65))).is_err());
  }
}
