//! Prompt extraction from the workflow's event-stream reply.
//!
//! The upstream stream is not schema-stable across workflow versions, so every
//! `data:` payload is probed against [`PROBES`] in order and each hit replaces
//! the running prompt. Later events therefore override earlier ones.

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Returned when the stream finished without any recognised prompt field.
pub const PROMPT_NOT_FOUND: &str = "Generated prompt not found in response";

/// An explicit `Error` event reported by the workflow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Workflow execution failed: {0}")]
pub struct WorkflowFailure(pub String);

/// One `data:` line that parsed as JSON, with the event name in effect.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
  pub event: String,
  pub data: Value,
}

type Probe = fn(&Value) -> Option<String>;

/// Field probes in application order; each match overwrites the previous one.
pub const PROBES: [(&str, Probe); 7] = [
  ("output", probe_output as Probe),
  ("result", probe_result as Probe),
  ("workflow_result", probe_workflow_result as Probe),
  ("content", probe_content as Probe),
  ("node_outputs", probe_node_outputs as Probe),
  ("outputs", probe_outputs as Probe),
  ("string", probe_bare_string as Probe),
];

/// Splits the body into events. `id:` starts a new logical event and clears the
/// current name; `data:` lines that are not valid JSON are dropped.
pub fn parse_events(body: &str) -> Vec<StreamEvent> {
  let mut events = Vec::new();
  let mut current_event = String::new();

  for line in body.split('\n') {
    if line.starts_with("id:") {
      current_event.clear();
    } else if let Some(rest) = line.strip_prefix("event:") {
      current_event = rest.trim().to_string();
    } else if let Some(rest) = line.strip_prefix("data:") {
      match serde_json::from_str::<Value>(rest.trim()) {
        Ok(data) => events.push(StreamEvent { event: current_event.clone(), data }),
        Err(e) => debug!(error = %e, "skipping malformed data line"),
      }
    }
  }
  events
}

/// Scans the stream and returns the last prompt written by the probe table,
/// or the failure message of the first `Error` event carrying `error_message`.
pub fn extract_prompt(body: &str) -> Result<String, WorkflowFailure> {
  let mut prompt: Option<String> = None;

  for event in parse_events(body) {
    if event.event == "Error" {
      if let Some(message) = event.data.get("error_message").filter(|v| truthy(v)) {
        return Err(WorkflowFailure(text_of(message)));
      }
    }
    for (name, probe) in PROBES.iter() {
      if let Some(found) = probe(&event.data) {
        debug!(field = *name, "prompt candidate found");
        prompt = Some(found);
      }
    }
  }

  Ok(prompt.unwrap_or_else(|| PROMPT_NOT_FOUND.to_string()))
}

fn truthy(value: &Value) -> bool {
  match value {
    Value::Null => false,
    Value::Bool(b) => *b,
    Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
    Value::String(s) => !s.is_empty(),
    Value::Array(_) | Value::Object(_) => true,
  }
}

fn text_of(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

fn field(data: &Value, name: &str) -> Option<String> {
  data.get(name).filter(|v| truthy(v)).map(text_of)
}

fn probe_output(data: &Value) -> Option<String> {
  field(data, "output")
}

fn probe_result(data: &Value) -> Option<String> {
  field(data, "result")
}

fn probe_workflow_result(data: &Value) -> Option<String> {
  field(data, "workflow_result")
}

/// `content` may hold a JSON document with its own `output`; plain text is used as is.
fn probe_content(data: &Value) -> Option<String> {
  let content = data.get("content").filter(|v| truthy(v))?;
  let Value::String(raw) = content else {
    return Some(content.to_string());
  };
  match serde_json::from_str::<Value>(raw) {
    Ok(nested) => field(&nested, "output"),
    Err(_) => Some(raw.clone()),
  }
}

fn probe_node_outputs(data: &Value) -> Option<String> {
  let nodes = data.get("node_outputs")?.as_array()?;
  let mut found = None;
  for node in nodes {
    if let Some(output) = field(node, "output") {
      found = Some(output);
    }
    if let Some(result) = field(node, "result") {
      found = Some(result);
    }
  }
  found
}

fn probe_outputs(data: &Value) -> Option<String> {
  let outputs = data.get("outputs")?.as_array()?;
  outputs
    .iter()
    .filter_map(|o| field(o, "value").or_else(|| field(o, "content")).or_else(|| field(o, "text")))
    .last()
}

fn probe_bare_string(data: &Value) -> Option<String> {
  match data {
    Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
    _ => None,
  }
}
