use std::convert::Infallible;
use std::sync::Arc;

use warp::Filter;

use crate::dispatch::Dispatcher;
use crate::error::handle_rejection;
use crate::orchestrator::Orchestrator;

pub mod debug;
pub mod sse;
pub mod tasks;

#[derive(Clone)]
pub struct AppState {
  pub orchestrator: Arc<Orchestrator>,
  pub dispatcher: Arc<dyn Dispatcher>,
  pub public_app_url: Option<String>,
  pub max_upload_bytes: u64,
}

impl AppState {
  pub fn status_url(&self, task_id: &str) -> String {
    match &self.public_app_url {
      Some(base) => format!("{}/tasks/{}", base, task_id),
      None => format!("/tasks/{}", task_id),
    }
  }
}

fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
  warp::any().map(move || state.clone())
}

pub fn routes(state: AppState) -> impl Filter<Extract = impl warp::Reply, Error = Infallible> + Clone {
  let health = warp::path!("health").and(warp::get()).map(|| "ok");

  tasks::submit_route(state.clone())
    .or(tasks::status_route(state.clone()))
    .or(tasks::missing_id_route())
    .or(sse::events_route(state.clone()))
    .or(debug::debug_route(state))
    .or(health)
    .recover(handle_rejection)
}
