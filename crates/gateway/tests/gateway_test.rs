use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use coderunner_core::config::{AppConfig, ServerConfig};
use coderunner_core::mocks::MockExecutor;
use coderunner_core::LanguageProfile;
use coderunner_gateway::{
    EmbeddedWorker, GatewayRouter, GatewayServer, HttpWorkerClient, ResultCache, CLIENT_ID_HEADER,
};

// =============================================================================
// Helpers
// =============================================================================

fn server_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
    }
}

/// Python served by `executor` in-process; JavaScript pointed at a port
/// nothing listens on.
fn gateway(executor: Arc<MockExecutor>, timeout_ms: u64, grace_ms: u64) -> GatewayServer {
    let mut config = AppConfig::default();
    config.gateway.forward_grace_ms = grace_ms;

    let python = LanguageProfile::new("python", "embedded", timeout_ms).with_aliases(["py"]);
    let javascript = LanguageProfile::new("javascript", "http://127.0.0.1:1", 10_000);

    let router = GatewayRouter::new(&config.gateway)
        .register(python, Arc::new(EmbeddedWorker::new("python", executor)))
        .unwrap()
        .register(
            javascript,
            Arc::new(HttpWorkerClient::new("javascript", "http://127.0.0.1:1").unwrap()),
        )
        .unwrap();

    let cache = Arc::new(ResultCache::new(50, Duration::from_secs(300)));
    GatewayServer::new(server_config(), Arc::new(router), cache)
}

fn execute(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/execute")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

// =============================================================================
// Execute
// =============================================================================

#[tokio::test]
async fn test_execute_and_cache_hit() {
    let executor = Arc::new(MockExecutor::new());
    let app = gateway(executor.clone(), 10_000, 1000).build_router();

    let response = app
        .clone()
        .oneshot(execute(json!({"code": "print('hello')", "language": "python"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let first = body_json(response).await;
    assert_eq!(first["output"], "print('hello')");
    assert_eq!(first["error"], Value::Null);
    assert_eq!(first["exitCode"], 0);
    assert_eq!(first["fromCache"], false);
    assert_eq!(first["language"], "python");

    // Alias and case resolve to the same cache key.
    let response = app
        .oneshot(execute(json!({"code": "print('hello')", "language": " PY "})))
        .await
        .unwrap();
    let second = body_json(response).await;
    assert_eq!(second["fromCache"], true);
    assert_eq!(second["output"], first["output"]);
    assert_ne!(second["requestId"], first["requestId"]);

    assert_eq!(executor.call_count(), 1);
}

#[tokio::test]
async fn test_skip_cache_executes_again() {
    let executor = Arc::new(MockExecutor::new());
    let app = gateway(executor.clone(), 10_000, 1000).build_router();

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(execute(json!({"code": "1", "language": "python", "skipCache": true})))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["fromCache"], false);
    }
    assert_eq!(executor.call_count(), 2);
}

#[tokio::test]
async fn test_unsupported_language_never_reaches_worker() {
    let executor = Arc::new(MockExecutor::new());
    let app = gateway(executor.clone(), 10_000, 1000).build_router();

    let response = app
        .oneshot(execute(json!({"code": "+++", "language": "brainfuck"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "UNSUPPORTED_LANGUAGE");
    assert_eq!(json["language"], "brainfuck");
    assert_eq!(executor.call_count(), 0);
}

#[tokio::test]
async fn test_invalid_bodies_are_400() {
    let executor = Arc::new(MockExecutor::new());
    let app = gateway(executor.clone(), 10_000, 1000).build_router();

    for body in [
        json!({"language": "python"}),
        json!({"code": "", "language": "python"}),
        json!({"code": 42, "language": "python"}),
        json!({"code": "print(1)"}),
    ] {
        let response = app.clone().oneshot(execute(body.clone())).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", body);
        assert_eq!(body_json(response).await["code"], "INVALID_REQUEST");
    }

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/execute")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(executor.call_count(), 0);
}

#[tokio::test]
async fn test_oversized_code_is_413() {
    let executor = Arc::new(MockExecutor::new());
    let app = gateway(executor.clone(), 10_000, 1000).build_router();
    let limit = AppConfig::default().gateway.max_payload_bytes;

    let response = app
        .oneshot(execute(json!({"code": "x".repeat(limit + 1), "language": "python"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body_json(response).await["code"], "PAYLOAD_TOO_LARGE");
    assert_eq!(executor.call_count(), 0);
}

#[tokio::test]
async fn test_unreachable_worker_is_500() {
    let app = gateway(Arc::new(MockExecutor::new()), 10_000, 1000).build_router();
    let response = app
        .oneshot(execute(json!({"code": "console.log(1)", "language": "javascript"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = body_json(response).await;
    assert_eq!(json["code"], "WORKER_UNREACHABLE");
    assert_eq!(json["language"], "javascript");
    assert!(json["error"].as_str().unwrap().contains("javascript sandbox"));
}

#[tokio::test]
async fn test_stuck_worker_reports_timeout() {
    let executor = Arc::new(MockExecutor::new().with_delay(Duration::from_secs(30)));
    let app = gateway(executor.clone(), 100, 50).build_router();

    let response = app
        .oneshot(execute(json!({"code": "while True: pass", "language": "python"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["timedOut"], true);
    assert_eq!(json["error"], "Execution timeout");
    assert!(json["executionTime"].as_u64().unwrap() >= 150);
    assert_eq!(executor.finished_count(), 0);
}

// =============================================================================
// Queue & cache endpoints
// =============================================================================

#[tokio::test]
async fn test_queued_execution_and_status() {
    let executor = Arc::new(MockExecutor::new());
    let app = gateway(executor.clone(), 10_000, 1000).build_router();

    let mut request = execute(json!({"code": "print(2)", "language": "python"}));
    request
        .headers_mut()
        .insert(CLIENT_ID_HEADER, "alice".parse().unwrap());
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["output"], "print(2)");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/queue")
                .header(CLIENT_ID_HEADER, "alice")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        body_json(response).await,
        json!({"pending": 0, "running": false})
    );

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/cancel")
                .header(CLIENT_ID_HEADER, "alice")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        body_json(response).await,
        json!({"runningCancelled": false, "discarded": 0})
    );
}

#[tokio::test]
async fn test_cancel_requires_client_id() {
    let app = gateway(Arc::new(MockExecutor::new()), 10_000, 1000).build_router();

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/cancel")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cancel_over_http_resolves_running_job() {
    let executor = Arc::new(MockExecutor::new().with_delay(Duration::from_secs(30)));
    let app = gateway(executor.clone(), 60_000, 1000).build_router();

    let mut request = execute(json!({"code": "sleep", "language": "python"}));
    request
        .headers_mut()
        .insert(CLIENT_ID_HEADER, "bob".parse().unwrap());
    let running = tokio::spawn(app.clone().oneshot(request));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/cancel")
                .header(CLIENT_ID_HEADER, "bob")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_json(response).await["runningCancelled"], true);

    let response = running.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["cancelled"], true);
    assert_eq!(json["error"], "Execution cancelled");
}

#[tokio::test]
async fn test_clear_cache() {
    let executor = Arc::new(MockExecutor::new());
    let app = gateway(executor.clone(), 10_000, 1000).build_router();

    let run = || execute(json!({"code": "print(3)", "language": "python"}));
    app.clone().oneshot(run()).await.unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/cache")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app.oneshot(run()).await.unwrap();
    assert_eq!(body_json(response).await["fromCache"], false);
    assert_eq!(executor.call_count(), 2);
}

// =============================================================================
// Health, CORS, fallback
// =============================================================================

#[tokio::test]
async fn test_health_degrades_only_unreachable_language() {
    let app = gateway(Arc::new(MockExecutor::new()), 10_000, 1000).build_router();

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["supportedLanguages"], json!(["python", "javascript"]));
    assert_eq!(json["workers"]["python"]["available"], true);
    assert_eq!(json["workers"]["python"]["address"], "embedded");
    assert_eq!(json["workers"]["javascript"]["available"], false);
    assert_eq!(json["cache"]["entries"], 0);
    assert!(json["timestamp"].is_string());
}

#[tokio::test]
async fn test_options_preflight_and_unknown_route() {
    let app = gateway(Arc::new(MockExecutor::new()), 10_000, 1000).build_router();

    for uri in ["/execute", "/health", "/anything"] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{}", uri);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(body.is_empty());
    }

    let response = app
        .oneshot(Request::builder().uri("/missing").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
