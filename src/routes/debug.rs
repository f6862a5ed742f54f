use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use warp::{Filter, Rejection};

use super::{with_state, AppState};
use crate::upstream::CredentialView;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Environment {
  #[serde(flatten)]
  credentials: CredentialView,
  has_app_url: bool,
  app_url: String,
}

#[derive(Serialize)]
struct Reachability {
  available: bool,
  error: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DebugReport {
  success: bool,
  environment: Environment,
  coze_api: Reachability,
  timestamp: String,
}

/// Configuration presence plus a live connectivity check against the upstream.
pub fn debug_route(state: AppState) -> impl Filter<Extract = (warp::reply::Json,), Error = Rejection> + Clone {
  warp::path!("debug")
    .and(warp::get())
    .and(with_state(state))
    .and_then(debug_report)
}

async fn debug_report(state: AppState) -> Result<warp::reply::Json, Rejection> {
  let upstream = state.orchestrator.upstream();
  let environment = Environment {
    credentials: upstream.credentials_view(),
    has_app_url: state.public_app_url.is_some(),
    app_url: state.public_app_url.clone().unwrap_or_else(|| "not set".to_string()),
  };

  let coze_api = match upstream.check_reachable().await {
    Ok(()) => Reachability { available: true, error: None },
    Err(e) => {
      warn!(error = %e, "upstream connectivity check failed");
      Reachability { available: false, error: Some(e.to_string()) }
    }
  };
  info!(available = coze_api.available, "diagnostics served");

  Ok(warp::reply::json(&DebugReport {
    success: true,
    environment,
    coze_api,
    timestamp: Utc::now().to_rfc3339(),
  }))
}
