use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio_test::assert_ok;
use warp::http::StatusCode;
use warp::Filter;

use imgprompt::config::UpstreamConfig;
use imgprompt::dispatch::{BackgroundDispatcher, Dispatcher, InlineDispatcher};
use imgprompt::models::{now_millis, PromptResult, Task, TaskState, EXPIRY_WINDOW_MS};
use imgprompt::orchestrator::Orchestrator;
use imgprompt::routes::{routes, AppState};
use imgprompt::store::{MemoryTaskStore, StatelessTaskStore, TaskStore};
use imgprompt::upstream::CozeClient;

const BOUNDARY: &str = "imgprompt-test-boundary";
const TOKEN: &str = "pat_test";
const FILE_ID: &str = "file_7f3a";
const PROMPT: &str = "a red fox curled up in fresh snow, soft morning light";
const WORKFLOW_STREAM: &str = r#"event: Message
data: {"content":"{\"output\":\"a red fox curled up in fresh snow, soft morning light\"}","node_title":"End","node_is_finish":true}

event: Done
data: {"debug_url":"https://example.invalid/debug"}
"#;

#[derive(Default)]
struct Seen {
  calls: usize,
  auth: Vec<String>,
  upload_size: usize,
  workflow: Option<Value>,
}

struct FakeCoze {
  addr: SocketAddr,
  seen: Arc<Mutex<Seen>>,
}

impl FakeCoze {
  fn base_url(&self) -> String {
    format!("http://{}", self.addr)
  }

  fn calls(&self) -> usize {
    self.seen.lock().unwrap().calls
  }
}

fn fake_coze(upload_status: StatusCode, upload_body: &'static str) -> FakeCoze {
  fake_coze_with((upload_status, upload_body), (StatusCode::OK, WORKFLOW_STREAM))
}

fn fake_coze_with(
  (upload_status, upload_body): (StatusCode, &'static str),
  (workflow_status, workflow_body): (StatusCode, &'static str),
) -> FakeCoze {
  let seen = Arc::new(Mutex::new(Seen::default()));

  let upload_seen = seen.clone();
  let upload = warp::path!("v1" / "files" / "upload")
    .and(warp::post())
    .and(warp::header::<String>("authorization"))
    .and(warp::body::bytes())
    .map(move |auth: String, body: bytes::Bytes| {
      let mut seen = upload_seen.lock().unwrap();
      seen.calls += 1;
      seen.auth.push(auth);
      seen.upload_size = body.len();
      warp::reply::with_status(upload_body, upload_status)
    });

  let workflow_seen = seen.clone();
  let workflow = warp::path!("v1" / "workflow" / "stream_run")
    .and(warp::post())
    .and(warp::header::<String>("authorization"))
    .and(warp::body::json())
    .map(move |auth: String, payload: Value| {
      let mut seen = workflow_seen.lock().unwrap();
      seen.calls += 1;
      seen.auth.push(auth);
      seen.workflow = Some(payload);
      warp::reply::with_status(
        warp::reply::with_header(workflow_body, "content-type", "text/event-stream"),
        workflow_status,
      )
    });

  let workspace_seen = seen.clone();
  let workspaces = warp::path!("v1" / "workspace" / "list")
    .and(warp::get())
    .and(warp::header::<String>("authorization"))
    .map(move |auth: String| {
      let mut seen = workspace_seen.lock().unwrap();
      seen.calls += 1;
      seen.auth.push(auth);
      r#"{"code":0,"data":{"workspaces":[]}}"#
    });

  let (addr, server) = warp::serve(upload.or(workflow).or(workspaces)).bind_ephemeral(([127, 0, 0, 1], 0));
  tokio::spawn(server);
  FakeCoze { addr, seen }
}

fn upload_ok() -> FakeCoze {
  fake_coze(StatusCode::OK, r#"{"code":0,"msg":"","data":{"id":"file_7f3a","bytes":10240}}"#)
}

enum Mode {
  Inline,
  Background,
}

fn app_state(store: Arc<dyn TaskStore>, base_url: String, token: Option<&str>, mode: Mode) -> AppState {
  let upstream = CozeClient::new(UpstreamConfig {
    api_token: token.map(str::to_string),
    workflow_id: Some("7480".into()),
    base_url,
    ..UpstreamConfig::default()
  });
  let orchestrator = Arc::new(Orchestrator::new(store, Arc::new(upstream)));
  let dispatcher: Arc<dyn Dispatcher> = match mode {
    Mode::Inline => Arc::new(InlineDispatcher::new(orchestrator.clone(), Duration::from_secs(30))),
    Mode::Background => Arc::new(BackgroundDispatcher::new(orchestrator.clone())),
  };
  AppState { orchestrator, dispatcher, public_app_url: None, max_upload_bytes: 10 * 1024 * 1024 }
}

fn jpeg(size: usize) -> Vec<u8> {
  let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0];
  bytes.resize(size, 0x42);
  bytes
}

fn form(image: Option<&[u8]>, style: Option<&str>) -> Vec<u8> {
  let mut body = Vec::new();
  if let Some(image) = image {
    body.extend_from_slice(
      format!(
        "--{}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"fox.jpg\"\r\nContent-Type: image/jpeg\r\n\r\n",
        BOUNDARY
      )
        .as_bytes(),
    );
    body.extend_from_slice(image);
    body.extend_from_slice(b"\r\n");
  }
  if let Some(style) = style {
    body.extend_from_slice(
      format!("--{}\r\nContent-Disposition: form-data; name=\"style_preference\"\r\n\r\n{}\r\n", BOUNDARY, style)
        .as_bytes(),
    );
  }
  body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
  body
}

async fn submit(state: &AppState, body: Vec<u8>) -> (StatusCode, Value) {
  let res = warp::test::request()
    .method("POST")
    .path("/tasks")
    .header("content-type", format!("multipart/form-data; boundary={}", BOUNDARY))
    .body(body)
    .reply(&routes(state.clone()))
    .await;
  (res.status(), serde_json::from_slice(res.body()).unwrap_or(Value::Null))
}

async fn status(state: &AppState, task_id: &str) -> (StatusCode, Value) {
  let res = warp::test::request()
    .method("GET")
    .path(&format!("/tasks/{}", task_id))
    .reply(&routes(state.clone()))
    .await;
  (res.status(), serde_json::from_slice(res.body()).unwrap_or(Value::Null))
}

async fn wait_until_finished(state: &AppState, task_id: &str) -> Value {
  for _ in 0..100 {
    let (code, body) = status(state, task_id).await;
    assert_eq!(code, StatusCode::OK);
    if body["status"] == "completed" || body["status"] == "failed" {
      return body;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
  }
  panic!("task {} never finished", task_id);
}

#[tokio::test]
async fn inline_submission_completes_with_prompt_and_file_id() {
  let coze = upload_ok();
  let mut state = app_state(Arc::new(MemoryTaskStore::new()), coze.base_url(), Some(TOKEN), Mode::Inline);
  state.public_app_url = Some("https://prompts.example.com".into());

  let (code, body) = submit(&state, form(Some(&jpeg(10 * 1024)), Some("flux"))).await;
  assert_eq!(code, StatusCode::OK);
  assert_eq!(body["success"], true);
  let task_id = body["taskId"].as_str().unwrap().to_string();
  assert!(task_id.starts_with("task_"));
  assert_eq!(body["statusUrl"], format!("https://prompts.example.com/tasks/{}", task_id));

  let (code, view) = status(&state, &task_id).await;
  assert_eq!(code, StatusCode::OK);
  assert_eq!(view["status"], "completed");
  assert_eq!(view["result"]["prompt"], PROMPT);
  assert_eq!(view["result"]["fileId"], FILE_ID);
  assert!(view.get("error").is_none());

  let seen = coze.seen.lock().unwrap();
  assert_eq!(seen.calls, 2);
  assert!(seen.auth.iter().all(|a| a == "Bearer pat_test"));
  assert!(seen.upload_size > 10 * 1024);
  let payload = seen.workflow.as_ref().unwrap();
  assert_eq!(payload["workflow_id"], "7480");
  assert_eq!(payload["parameters"]["style_preferenc"], "flux");
  assert_eq!(payload["parameters"]["image"], "{\"file_id\":\"file_7f3a\"}");
}

#[tokio::test]
async fn rejected_upload_marks_background_task_failed() {
  let coze = fake_coze(StatusCode::UNAUTHORIZED, r#"{"code":4100,"msg":"authentication is invalid"}"#);
  let state = app_state(Arc::new(MemoryTaskStore::new()), coze.base_url(), Some(TOKEN), Mode::Background);

  let (code, body) = submit(&state, form(Some(&jpeg(2048)), None)).await;
  assert_eq!(code, StatusCode::OK);
  let task_id = body["taskId"].as_str().unwrap().to_string();

  let view = wait_until_finished(&state, &task_id).await;
  assert_eq!(view["status"], "failed");
  assert_eq!(
    view["error"],
    r#"File upload failed: {"code":4100,"msg":"authentication is invalid"}"#
  );
  assert!(view.get("result").is_none());
  assert_eq!(coze.calls(), 1);
}

#[tokio::test]
async fn missing_token_fails_before_any_upstream_call() {
  let coze = upload_ok();
  let store = Arc::new(MemoryTaskStore::new());
  let state = app_state(store.clone(), coze.base_url(), None, Mode::Inline);

  let (code, body) = submit(&state, form(Some(&jpeg(1024)), None)).await;
  assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
  assert_eq!(body["error"], "API configuration missing. Please configure COZE_API_TOKEN.");
  assert!(body["details"].as_str().unwrap().contains("COZE_API_TOKEN"));
  assert_eq!(coze.calls(), 0);
  assert!(assert_ok!(store.list_ids().await).is_empty());
}

#[tokio::test]
async fn submission_without_image_is_bad_request() {
  let coze = upload_ok();
  let state = app_state(Arc::new(MemoryTaskStore::new()), coze.base_url(), Some(TOKEN), Mode::Inline);

  let (code, body) = submit(&state, form(None, Some("flux"))).await;
  assert_eq!(code, StatusCode::BAD_REQUEST);
  assert_eq!(body["error"], "No image file provided");
  assert_eq!(coze.calls(), 0);
}

#[tokio::test]
async fn invalid_style_is_bad_request() {
  let coze = upload_ok();
  let state = app_state(Arc::new(MemoryTaskStore::new()), coze.base_url(), Some(TOKEN), Mode::Inline);

  let (code, _) = submit(&state, form(Some(&jpeg(1024)), Some("<img onerror=x>"))).await;
  assert_eq!(code, StatusCode::BAD_REQUEST);
  assert_eq!(coze.calls(), 0);
}

#[tokio::test]
async fn oversized_upload_is_rejected() {
  let coze = upload_ok();
  let mut state = app_state(Arc::new(MemoryTaskStore::new()), coze.base_url(), Some(TOKEN), Mode::Inline);
  state.max_upload_bytes = 1024;

  let (code, _) = submit(&state, form(Some(&jpeg(10 * 1024)), None)).await;
  assert_eq!(code, StatusCode::PAYLOAD_TOO_LARGE);
  assert_eq!(coze.calls(), 0);
}

#[tokio::test]
async fn unknown_id_lists_available_tasks() {
  let store = Arc::new(MemoryTaskStore::new());
  assert_ok!(store.create("task_1_aaaaaaaaaaaa", &Task::pending(now_millis())).await);
  let state = app_state(store, "http://127.0.0.1:9".into(), Some(TOKEN), Mode::Inline);

  let (code, body) = status(&state, "task_404_bbbbbbbbbbbb").await;
  assert_eq!(code, StatusCode::NOT_FOUND);
  assert_eq!(body["error"], "Task not found");
  assert_eq!(body["availableTaskIds"], serde_json::json!(["task_1_aaaaaaaaaaaa"]));
}

#[tokio::test]
async fn expired_task_is_gone_then_unknown() {
  let store = Arc::new(MemoryTaskStore::new());
  let finished = Task {
    state: TaskState::Completed { result: PromptResult { prompt: "old".into(), file_id: "f".into() } },
    start_time: now_millis() - EXPIRY_WINDOW_MS - 5_000,
  };
  assert_ok!(store.create("task_old", &finished).await);
  let state = app_state(store, "http://127.0.0.1:9".into(), Some(TOKEN), Mode::Inline);

  let (code, body) = status(&state, "task_old").await;
  assert_eq!(code, StatusCode::GONE);
  assert_eq!(body["error"], "Task expired");

  let (code, _) = status(&state, "task_old").await;
  assert_eq!(code, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn fresh_task_reads_back_pending() {
  let store = Arc::new(MemoryTaskStore::new());
  let task_id = assert_ok!(store.create("task_fresh", &Task::pending(now_millis())).await);
  let state = app_state(store, "http://127.0.0.1:9".into(), Some(TOKEN), Mode::Inline);

  let (code, view) = status(&state, &task_id).await;
  assert_eq!(code, StatusCode::OK);
  assert_eq!(view["taskId"], "task_fresh");
  assert_eq!(view["status"], "pending");
  assert!(view["elapsedTime"].as_i64().unwrap() < 1_000);
  assert!(view.get("result").is_none());
  assert!(view.get("error").is_none());
}

#[tokio::test]
async fn status_without_id_is_bad_request() {
  let state = app_state(Arc::new(MemoryTaskStore::new()), "http://127.0.0.1:9".into(), Some(TOKEN), Mode::Inline);
  let res = warp::test::request().method("GET").path("/tasks").reply(&routes(state)).await;
  assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stateless_inline_returns_id_of_final_state() {
  let coze = upload_ok();
  let state = app_state(Arc::new(StatelessTaskStore), coze.base_url(), Some(TOKEN), Mode::Inline);

  let (code, body) = submit(&state, form(Some(&jpeg(4096)), None)).await;
  assert_eq!(code, StatusCode::OK);
  let task_id = body["taskId"].as_str().unwrap().to_string();

  let (code, view) = status(&state, &task_id).await;
  assert_eq!(code, StatusCode::OK);
  assert_eq!(view["status"], "completed");
  assert_eq!(view["result"]["prompt"], PROMPT);
  assert_eq!(coze.seen.lock().unwrap().workflow.as_ref().unwrap()["parameters"]["style_preferenc"], "detailed");

  let (code, body) = status(&state, "task_1_000000000000").await;
  assert_eq!(code, StatusCode::NOT_FOUND);
  assert_eq!(body["availableTaskIds"], serde_json::json!([]));
}

#[tokio::test]
async fn health_answers_ok() {
  let state = app_state(Arc::new(MemoryTaskStore::new()), "http://127.0.0.1:9".into(), None, Mode::Inline);
  let res = warp::test::request().method("GET").path("/health").reply(&routes(state)).await;
  assert_eq!(res.status(), StatusCode::OK);
  assert_eq!(res.body().as_ref(), b"ok");
}

#[tokio::test]
async fn failed_workflow_run_keeps_raw_body() {
  let coze = fake_coze_with(
    (StatusCode::OK, r#"{"code":0,"data":{"id":"file_7f3a"}}"#),
    (StatusCode::INTERNAL_SERVER_ERROR, r#"{"code":5000,"msg":"boom"}"#),
  );
  let state = app_state(Arc::new(MemoryTaskStore::new()), coze.base_url(), Some(TOKEN), Mode::Background);

  let (_, body) = submit(&state, form(Some(&jpeg(2048)), None)).await;
  let view = wait_until_finished(&state, body["taskId"].as_str().unwrap()).await;
  assert_eq!(view["status"], "failed");
  assert_eq!(view["error"], r#"Workflow execution failed: {"code":5000,"msg":"boom"}"#);
  assert_eq!(coze.calls(), 2);
}

#[tokio::test]
async fn upload_reply_without_file_id_fails_task() {
  let coze = fake_coze(StatusCode::OK, r#"{"code":0,"data":{}}"#);
  let state = app_state(Arc::new(MemoryTaskStore::new()), coze.base_url(), Some(TOKEN), Mode::Inline);

  let (code, body) = submit(&state, form(Some(&jpeg(2048)), None)).await;
  assert_eq!(code, StatusCode::OK);
  let (_, view) = status(&state, body["taskId"].as_str().unwrap()).await;
  assert_eq!(view["status"], "failed");
  assert_eq!(view["error"], r#"No file ID returned from upload: {"code":0,"data":{}}"#);
  assert_eq!(coze.calls(), 1);
}

#[tokio::test]
async fn event_stream_sends_final_status_and_closes() {
  let store = Arc::new(MemoryTaskStore::new());
  let failed = Task { state: TaskState::Failed { error: "upstream said no".into() }, start_time: now_millis() };
  assert_ok!(store.create("task_done", &failed).await);
  let state = app_state(store, "http://127.0.0.1:9".into(), Some(TOKEN), Mode::Inline);

  let res = warp::test::request()
    .method("GET")
    .path("/tasks/task_done/events")
    .reply(&routes(state))
    .await;
  assert_eq!(res.status(), StatusCode::OK);
  assert_eq!(res.headers()["content-type"], "text/event-stream");

  let body = String::from_utf8(res.body().to_vec()).unwrap();
  assert_eq!(body.matches("event:").count(), 1);
  assert!(body.contains("event:status"));
  assert!(body.contains(r#""status":"failed""#));
  assert!(body.contains(r#""error":"upstream said no""#));
}

#[tokio::test]
async fn debug_reports_masked_config_and_reachability() {
  let coze = upload_ok();
  let mut state = app_state(Arc::new(MemoryTaskStore::new()), coze.base_url(), Some(TOKEN), Mode::Inline);
  state.public_app_url = Some("https://prompts.example.com".into());

  let res = warp::test::request().method("GET").path("/debug").reply(&routes(state)).await;
  assert_eq!(res.status(), StatusCode::OK);
  let raw = String::from_utf8(res.body().to_vec()).unwrap();
  assert!(!raw.contains(TOKEN));

  let body: Value = serde_json::from_str(&raw).unwrap();
  assert_eq!(body["success"], true);
  assert_eq!(body["environment"]["hasCozeToken"], true);
  assert_eq!(body["environment"]["cozeTokenLength"], TOKEN.len());
  assert_eq!(body["environment"]["workflowId"], "7480...");
  assert_eq!(body["environment"]["appUrl"], "https://prompts.example.com");
  assert_eq!(body["cozeApi"]["available"], true);
  assert_eq!(body["cozeApi"]["error"], Value::Null);
  assert_eq!(coze.seen.lock().unwrap().auth, vec!["Bearer pat_test".to_string()]);
}

#[tokio::test]
async fn debug_without_token_skips_upstream() {
  let coze = upload_ok();
  let state = app_state(Arc::new(MemoryTaskStore::new()), coze.base_url(), None, Mode::Inline);

  let res = warp::test::request().method("GET").path("/debug").reply(&routes(state)).await;
  let body: Value = serde_json::from_slice(res.body()).unwrap();
  assert_eq!(body["environment"]["hasCozeToken"], false);
  assert_eq!(body["environment"]["hasAppUrl"], false);
  assert_eq!(body["environment"]["appUrl"], "not set");
  assert_eq!(body["cozeApi"]["available"], false);
  assert!(body["cozeApi"]["error"].as_str().unwrap().contains("COZE_API_TOKEN"));
  assert_eq!(coze.calls(), 0);
}
