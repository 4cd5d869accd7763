// End-to-end tests for the HTTP boundary, driven through the router
// with the mock sandbox provider behind it.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use squall::provider::MockSandboxProvider;
use squall::router::{build_router, AppState, NDJSON_CONTENT_TYPE};
use squall::sandbox::SandboxTemplates;
use squall::session::SessionOrchestrator;

fn app(provider: Arc<MockSandboxProvider>) -> axum::Router {
    let orchestrator = SessionOrchestrator::new(
        provider,
        SandboxTemplates {
            primary: "squall".to_string(),
            fallback: "claude-code".to_string(),
        },
    );
    build_router(AppState::new(orchestrator, None, PathBuf::from(".")))
}

async fn send(
    app: &axum::Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, HeaderMap, Bytes) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let request = builder.body(body).expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    (status, headers, bytes)
}

fn ndjson_lines(bytes: &Bytes) -> Vec<Value> {
    std::str::from_utf8(bytes)
        .expect("utf8 body")
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect()
}

fn query_body(prompt: &str) -> Value {
    json!({
        "prompt": prompt,
        "anthropic_api_key": "sk-test",
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn query_streams_agent_events_as_ndjson() {
    let provider = Arc::new(MockSandboxProvider::with_stdout_lines([
        r#"{"type":"system","subtype":"init"}"#,
        r#"{"type":"assistant"}"#,
        r#"{"type":"result","subtype":"success","is_error":false,"num_turns":2}"#,
    ]));
    let app = app(provider.clone());

    let (status, headers, bytes) =
        send(&app, Method::POST, "/query", Some(query_body("hello"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some(NDJSON_CONTENT_TYPE)
    );

    let events = ndjson_lines(&bytes);
    assert_eq!(events.len(), 3);
    assert_eq!(events[0]["type"], "system");
    assert_eq!(events[1]["type"], "assistant");
    assert_eq!(events[2]["type"], "result");
    assert_eq!(events[2]["subtype"], "success");

    provider.wait_destroyed().await;
    assert_eq!(provider.destroy_count(), 1);
    assert_eq!(provider.provision_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn out_of_range_timeout_is_rejected_before_provisioning() {
    let provider = Arc::new(MockSandboxProvider::new());
    let app = app(provider.clone());

    let mut body = query_body("hello");
    body["timeout"] = json!(4);
    let (status, _headers, bytes) = send(&app, Method::POST, "/query", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let problem: Value = serde_json::from_slice(&bytes).expect("problem json");
    assert_eq!(problem["type"], "config_invalid");
    assert_eq!(problem["status"], 400);
    assert!(problem["request_id"].is_string());
    assert_eq!(provider.provision_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn traversal_upload_is_rejected_with_problem_details() {
    let provider = Arc::new(MockSandboxProvider::new());
    let app = app(provider.clone());

    let mut body = query_body("hello");
    body["files"] = json!({"../../etc/passwd": "root::0:0"});
    let (status, _headers, bytes) = send(&app, Method::POST, "/query", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let problem: Value = serde_json::from_slice(&bytes).expect("problem json");
    assert_eq!(problem["type"], "upload_rejected");
    assert_eq!(provider.provision_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_upload_is_a_413() {
    let provider = Arc::new(MockSandboxProvider::new());
    let app = app(provider.clone());

    let mut body = query_body("hello");
    body["files"] = json!({"big.bin": "x".repeat(5_000_001)});
    let (status, _headers, bytes) = send(&app, Method::POST, "/query", Some(body)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

    let problem: Value = serde_json::from_slice(&bytes).expect("problem json");
    assert_eq!(problem["type"], "upload_rejected");
    assert_eq!(problem["status"], 413);
    assert_eq!(provider.provision_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_failure_after_streaming_ends_with_an_error_event() {
    // The agent prints one event and then garbage: the response is still
    // 200, the failure arrives as the final event on the stream.
    let provider = Arc::new(MockSandboxProvider::with_stdout_lines([
        r#"{"type":"assistant"}"#,
        "core dumped",
    ]));
    let app = app(provider.clone());

    let (status, _headers, bytes) =
        send(&app, Method::POST, "/query", Some(query_body("hello"))).await;
    assert_eq!(status, StatusCode::OK);

    let events = ndjson_lines(&bytes);
    assert_eq!(events[0]["type"], "assistant");
    let last = events.last().expect("final event");
    assert_eq!(last["type"], "error");
    assert_eq!(last["error_type"], "stream_framing");

    provider.wait_destroyed().await;
    assert_eq!(provider.destroy_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn uploaded_files_reach_the_sandbox_under_the_input_root() {
    let provider = Arc::new(MockSandboxProvider::with_stdout_lines([
        r#"{"type":"result","subtype":"success"}"#,
    ]));
    let app = app(provider.clone());

    let mut body = query_body("hello");
    body["files"] = json!({"src/main.py": "print('hi')"});
    let (status, _headers, _bytes) = send(&app, Method::POST, "/query", Some(body)).await;
    assert_eq!(status, StatusCode::OK);

    provider.wait_destroyed().await;
    assert!(provider
        .written_paths()
        .contains(&"/home/user/src/main.py".to_string()));
}

#[tokio::test]
async fn health_reports_ok() {
    let app = app(Arc::new(MockSandboxProvider::new()));
    let (status, _headers, bytes) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    let payload: Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(payload["status"], "ok");
}

#[tokio::test]
async fn unknown_route_is_404() {
    let app = app(Arc::new(MockSandboxProvider::new()));
    let (status, _headers, _bytes) = send(&app, Method::GET, "/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
