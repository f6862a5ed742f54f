//! HTTP error taxonomy.
//!
//! Store failures are logged in full and answered with a generic message.
//! Validation and configuration problems go back to the caller verbatim.

use std::convert::Infallible;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::error;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Rejection, Reply};

use crate::store::StoreError;
use crate::upstream::ConfigurationError;

#[derive(Debug, Error)]
pub enum ApiError {
  #[error(transparent)]
  Configuration(#[from] ConfigurationError),

  #[error("{0}")]
  Validation(String),

  #[error("Task not found")]
  NotFound { available: Vec<String> },

  #[error("Task expired")]
  Expired,

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("{message}")]
  Internal { message: String, details: String },
}

impl warp::reject::Reject for ApiError {}

impl ApiError {
  fn parts(&self) -> (StatusCode, Value) {
    match self {
      ApiError::Configuration(e) => (
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({ "error": e.to_string(), "details": e.hint() }),
      ),
      ApiError::Validation(message) => (StatusCode::BAD_REQUEST, json!({ "error": message })),
      ApiError::NotFound { available } => (
        StatusCode::NOT_FOUND,
        json!({ "error": "Task not found", "availableTaskIds": available }),
      ),
      ApiError::Expired => (StatusCode::GONE, json!({ "error": "Task expired" })),
      ApiError::Store(e) => {
        error!(error = %e, "task store error");
        (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": "internal server error" }))
      }
      ApiError::Internal { message, details } => {
        error!(message = %message, details = %details, "internal server error");
        (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": message, "details": details }))
      }
    }
  }
}

impl Reply for ApiError {
  fn into_response(self) -> Response {
    let (status, body) = self.parts();
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
  }
}

/// Turns whatever rejection survived the route tree into a JSON error body.
pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
  let (status, body) = if let Some(api) = err.find::<ApiError>() {
    api.parts()
  } else if err.is_not_found() {
    (StatusCode::NOT_FOUND, json!({ "error": "Not found" }))
  } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
    (StatusCode::PAYLOAD_TOO_LARGE, json!({ "error": "Image is too large" }))
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, json!({ "error": "Method not allowed" }))
  } else {
    (StatusCode::BAD_REQUEST, json!({ "error": "Malformed request", "details": format!("{:?}", err) }))
  };
  Ok(warp::reply::with_status(warp::reply::json(&body), status))
}
