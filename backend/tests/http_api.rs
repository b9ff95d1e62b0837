//! HTTP API tests driven through the router

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::*;
use strands_backend::deploy::fsm::DeploymentState;
use strands_backend::exec::{ExecutorOptions, LocalExecutor};
use strands_backend::invoke::credentials::CredentialSource;
use strands_backend::invoke::sigv4::Credentials;
use strands_backend::invoke::Invoker;
use strands_backend::server::serve::router;
use strands_backend::server::state::ServerState;

const SSE_BODY: &str =
    "event: message\ndata: \"Hel\"\n\nevent: message\ndata: \"lo\"\n\nevent: end\ndata: \"\"\n\n";

fn app(harness: &Harness) -> Router {
    let invoker = Invoker::new(
        CredentialSource::fixed(Credentials::new("AKIDEXAMPLE", "secret")),
        Duration::from_secs(5),
    )
    .unwrap();
    let executor = LocalExecutor::new(
        harness.runner.clone(),
        ExecutorOptions {
            python_bin: "python3".to_string(),
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
        },
    );
    router(Arc::new(ServerState {
        manager: Arc::new(harness.manager.clone()),
        invoker: Arc::new(invoker),
        executor: Arc::new(executor),
        builder: harness.builder.clone(),
        python_bin: "python3".to_string(),
        default_region: "us-east-1".to_string(),
        status_max_age: Duration::from_secs(3600),
    }))
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, String, String) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, content_type, String::from_utf8(bytes.to_vec()).unwrap())
}

#[tokio::test]
async fn test_health() {
    let harness = Harness::new(ScriptedRunner::new(), fast_settings());
    let (status, _, body) = send(&app(&harness), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_invalid_deployment_returns_field_errors() {
    let harness = Harness::new(ScriptedRunner::new(), fast_settings());
    let request = post(
        "/deployments",
        json!({
            "config": {"target": "lambda", "function_name": "hello", "timeout": 5000},
            "code": SYNC_AGENT,
        }),
    );
    let (status, _, body) = send(&app(&harness), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["fields"][0]["field"], "timeout");
    assert!(harness.statuses.is_empty());
}

#[tokio::test]
async fn test_deployment_status_lifecycle() {
    let runner = ScriptedRunner::new();
    runner.on(
        "aws",
        &["describe-stacks"],
        vec![
            stack_missing("strands-hello"),
            stack("strands-hello", "CREATE_COMPLETE", &[("SyncFunctionUrl", SYNC_URL)]),
        ],
    );
    let harness = Harness::new(runner, fast_settings());
    let app = app(&harness);

    let request = post(
        "/deployments",
        json!({"config": {"target": "lambda", "function_name": "hello"}, "code": SYNC_AGENT}),
    );
    let (status, _, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let body: Value = serde_json::from_str(&body).unwrap();
    let id = body["deployment_id"].as_str().unwrap().to_string();
    assert_eq!(body["status_url"], format!("/deployments/{id}"));

    let mut state = DeploymentState::Pending;
    for _ in 0..200 {
        state = harness.statuses.get(&id).unwrap().state;
        if state.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state, DeploymentState::Completed);

    let (status, _, body) = send(&app, get(&format!("/deployments/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    let record: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(record["state"], "completed");
    assert_eq!(record["endpoint_url"], SYNC_URL);

    let (_, _, body) = send(&app, get("/deployments")).await;
    let listing: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(listing["total"], 1);

    let delete = Request::builder()
        .method("DELETE")
        .uri(format!("/deployments/{id}"))
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&app, delete).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = send(&app, get(&format!("/deployments/{id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_deployment_is_not_found() {
    let harness = Harness::new(ScriptedRunner::new(), fast_settings());
    let app = app(&harness);
    let (status, _, _) = send(&app, get("/deployments/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let delete = Request::builder()
        .method("DELETE")
        .uri("/deployments/nope")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&app, delete).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_execute_collects_tokens() {
    let runner = ScriptedRunner::new();
    runner.on(
        "python3",
        &[],
        vec![ok(concat!(
            "{\"type\":\"token\",\"data\":\"Hel\"}\n",
            "{\"type\":\"token\",\"data\":\"lo\"}\n",
            "{\"type\":\"end\"}\n",
        ))],
    );
    let harness = Harness::new(runner, fast_settings());
    let request = post("/execute", json!({"code": SYNC_AGENT, "input": "hi"}));
    let (status, _, body) = send(&app(&harness), request).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["output"], "Hello");
}

#[tokio::test]
async fn test_execute_stream_reports_exit_in_band() {
    let runner = ScriptedRunner::new();
    runner.on(
        "python3",
        &[],
        vec![exited(1, "{\"type\":\"token\",\"data\":\"partial\"}\n", "Traceback: boom")],
    );
    let harness = Harness::new(runner, fast_settings());
    let request = post(
        "/execute",
        json!({"code": SYNC_AGENT, "input": "hi", "stream": true}),
    );
    let (status, content_type, body) = send(&app(&harness), request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(content_type.starts_with("text/event-stream"));
    assert!(body.contains("event: message\ndata: \"partial\""));
    assert!(body.contains("event: error"));
    assert!(body.contains("boom"));
    assert!(body.trim_end().ends_with("event: end\ndata: \"\""));
}

#[tokio::test]
async fn test_invoke_ecs_json() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/invoke")
        .match_body(mockito::Matcher::Json(json!({"prompt": "hi"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"response":"hello there"}"#)
        .create_async()
        .await;

    let harness = Harness::new(ScriptedRunner::new(), fast_settings());
    let request = post("/invoke/ecs", json!({"prompt": "hi", "endpoint": server.url()}));
    let (status, _, body) = send(&app(&harness), request).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["response"], "hello there");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_invoke_lambda_stream_is_signed_and_relayed() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .match_header("authorization", mockito::Matcher::Regex("^AWS4-HMAC-SHA256 ".to_string()))
        .match_header("x-amz-date", mockito::Matcher::Any)
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(SSE_BODY)
        .create_async()
        .await;

    let harness = Harness::new(ScriptedRunner::new(), fast_settings());
    let url = format!("{}/", server.url());
    let request = post(
        "/invoke/lambda",
        json!({"prompt": "hi", "stream": true, "sync_url": url, "stream_url": url}),
    );
    let (status, content_type, body) = send(&app(&harness), request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(content_type.starts_with("text/event-stream"));
    assert!(body.contains("data: \"Hel\""));
    assert!(body.contains("data: \"lo\""));
    assert_eq!(body.matches("event: end").count(), 1);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_invoke_stream_collected_for_sync_caller() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(SSE_BODY)
        .create_async()
        .await;

    let harness = Harness::new(ScriptedRunner::new(), fast_settings());
    let request = post(
        "/invoke/lambda",
        json!({"prompt": "hi", "sync_url": format!("{}/", server.url())}),
    );
    let (status, _, body) = send(&app(&harness), request).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["response"], "Hello");
    assert_eq!(body["streamed"], true);
}

#[tokio::test]
async fn test_invoke_upstream_failure() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/")
        .with_status(500)
        .with_body("internal failure")
        .expect(2)
        .create_async()
        .await;

    let harness = Harness::new(ScriptedRunner::new(), fast_settings());
    let app = app(&harness);
    let url = format!("{}/", server.url());

    let (status, _, body) = send(&app, post("/invoke/lambda", json!({"prompt": "hi", "sync_url": url}))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body.contains("internal failure"));

    let (status, _, body) = send(
        &app,
        post("/invoke/lambda", json!({"prompt": "hi", "stream": true, "sync_url": url})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("event: error"));
    assert!(body.contains("500"));
    assert!(body.trim_end().ends_with("event: end\ndata: \"\""));
}

#[tokio::test]
async fn test_invoke_rejects_bad_requests() {
    let harness = Harness::new(ScriptedRunner::new(), fast_settings());
    let app = app(&harness);

    let (status, _, _) = send(&app, post("/invoke/ecs", json!({"prompt": "  ", "endpoint": "http://x"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, body) = send(&app, post("/invoke/lambda", json!({"prompt": "hi"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("sync_url"));

    let (status, _, _) = send(
        &app,
        post(
            "/invoke/agentcore",
            json!({
                "prompt": "hi",
                "stream": true,
                "runtime_arn": "arn:aws:bedrock-agentcore:us-east-1:123456789012:runtime/a-1",
                "session_id": "short",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
