use std::future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use tokio_stream::wrappers::IntervalStream;
use tracing::warn;
use warp::sse::Event;
use warp::{Filter, Rejection};

use super::{with_state, AppState};
use crate::models::{now_millis, Lookup, TaskView};
use crate::store::{StoreError, TaskStore};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Push variant of the status poll: one `status` event every two seconds
/// until the task is terminal, expired or unknown.
pub fn events_route(state: AppState) -> impl Filter<Extract = impl warp::Reply, Error = Rejection> + Clone {
  warp::path!("tasks" / String / "events")
    .and(warp::get())
    .and(with_state(state))
    .map(|task_id: String, state: AppState| {
      let store = state.orchestrator.store().clone();
      warp::sse::reply(warp::sse::keep_alive().stream(status_stream(store, task_id)))
    })
}

/// Builds the event for one poll and whether the stream should stop after it.
fn poll_event(task_id: &str, lookup: Result<Lookup, StoreError>) -> (Result<Event, serde_json::Error>, bool) {
  match lookup {
    Ok(Lookup::Found(task)) => {
      let done = task.status().is_terminal();
      (Event::default().event("status").json_data(TaskView::new(task_id, &task, now_millis())), done)
    }
    Ok(Lookup::Expired) => (Event::default().event("expired").json_data(json!({"error": "Task expired"})), true),
    Ok(Lookup::Missing) => (Event::default().event("error").json_data(json!({"error": "Task not found"})), true),
    Err(e) => {
      warn!(task_id, error = %e, "status stream lookup failed");
      (Event::default().event("error").json_data(json!({"error": "internal server error"})), true)
    }
  }
}

fn status_stream(
  store: Arc<dyn TaskStore>,
  task_id: String,
) -> impl futures::Stream<Item = Result<Event, serde_json::Error>> + Send + 'static {
  let ticks = IntervalStream::new(tokio::time::interval(POLL_INTERVAL));
  ticks
    .then(move |_| {
      let store = store.clone();
      let task_id = task_id.clone();
      async move {
        let lookup = store.lookup(&task_id).await;
        poll_event(&task_id, lookup)
      }
    })
    .scan(false, |finished, (event, done)| {
      if *finished {
        return future::ready(None);
      }
      *finished = done;
      future::ready(Some(event))
    })
}
