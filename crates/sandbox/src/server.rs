//! Axum-based HTTP server for a single-language worker.
//!
//! Speaks the same `/execute` and `/health` contract as the gateway, so the
//! gateway can forward requests unchanged.

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Json, State},
    http::{Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use coderunner_core::{
    config::ServerConfig, Error, ErrorResponse, ExecuteRequestBody, ExecuteResponse,
    ExecutionRequest, HealthResponse, Result,
};
use coderunner_telemetry::track_http;

use crate::engine::ProcessSandbox;

/// Worker HTTP server.
pub struct WorkerServer {
    config: ServerConfig,
    sandbox: Arc<ProcessSandbox>,
    metrics_handle: Option<PrometheusHandle>,
}

impl WorkerServer {
    /// Create a server in front of `sandbox`.
    pub fn new(config: ServerConfig, sandbox: Arc<ProcessSandbox>) -> Self {
        Self {
            config,
            sandbox,
            metrics_handle: None,
        }
    }

    /// Expose `GET /metrics`.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Build the Axum router.
    pub fn build_router(&self) -> Router {
        // Headroom for JSON escaping; real size checks happen in the handler.
        let body_limit = self.sandbox.config().max_payload_bytes * 2 + 64 * 1024;

        let mut router = Router::new()
            .route("/execute", post(execute_handler).options(preflight_handler))
            .route("/health", get(health_handler).options(preflight_handler));

        if let Some(handle) = &self.metrics_handle {
            let handle = handle.clone();
            router = router.route("/metrics", get(move || async move { handle.render() }));
        }

        router
            .route_layer(middleware::from_fn(track_http))
            .fallback(fallback_handler)
            .layer(DefaultBodyLimit::max(body_limit))
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                    .allow_headers(Any),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(self.sandbox.clone())
    }

    /// Run the server.
    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::internal(format!("Failed to bind {}: {}", addr, e)))?;

        tracing::info!(
            addr = %addr,
            language = %self.sandbox.profile().id,
            runtime = %self.sandbox.runtime_program(),
            runtime_available = self.sandbox.runtime_available(),
            "Worker server starting"
        );

        axum::serve(listener, self.build_router())
            .await
            .map_err(|e| Error::internal(format!("Server error: {}", e)))?;

        Ok(())
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Error rendered as `{error, code, language}` with the matching status.
struct ApiError {
    error: Error,
    language: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.error.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse {
            error: self.error.to_string(),
            code: self.error.code().to_string(),
            language: Some(self.language),
        };
        (status, Json(body)).into_response()
    }
}

/// Malformed JSON, a non-string `code` or a missing content type are 400s;
/// a body over the transport limit is a 413.
fn rejection_response(rejection: JsonRejection, language: String) -> Response {
    let (status, code) = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE")
    } else {
        (StatusCode::BAD_REQUEST, "INVALID_REQUEST")
    };
    let body = ErrorResponse {
        error: rejection.body_text(),
        code: code.to_string(),
        language: Some(language),
    };
    (status, Json(body)).into_response()
}

// =============================================================================
// Handlers
// =============================================================================

async fn execute_handler(
    State(sandbox): State<Arc<ProcessSandbox>>,
    payload: std::result::Result<Json<ExecuteRequestBody>, JsonRejection>,
) -> Response {
    let language = sandbox.profile().id.clone();
    let fail = |error: Error| {
        ApiError {
            error,
            language: language.clone(),
        }
        .into_response()
    };

    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => return rejection_response(rejection, language.clone()),
    };

    let request = match build_request(&sandbox, body.code, body.stdin) {
        Ok(request) => request,
        Err(e) => return fail(e),
    };

    tracing::debug!(
        request_id = %request.id,
        language = %language,
        code_len = request.source_code.len(),
        "Processing execute request"
    );

    match sandbox.run(request, body.timeout_ms).await {
        Ok(result) => Json(ExecuteResponse::from_result(&result, Some(&language))).into_response(),
        Err(e) => fail(e),
    }
}

fn build_request(
    sandbox: &ProcessSandbox,
    code: Option<String>,
    stdin: Option<String>,
) -> Result<ExecutionRequest> {
    let limit = sandbox.config().max_payload_bytes;
    let code = code
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| Error::invalid_request("Code must be a non-empty string"))?;
    for size in [code.len(), stdin.as_ref().map_or(0, String::len)] {
        if size > limit {
            return Err(Error::PayloadTooLarge { size, limit });
        }
    }

    let request = ExecutionRequest::new(sandbox.profile().id.clone(), code);
    Ok(match stdin {
        Some(stdin) => request.with_stdin(stdin),
        None => request,
    })
}

async fn health_handler(State(sandbox): State<Arc<ProcessSandbox>>) -> impl IntoResponse {
    let runtime_available = sandbox.runtime_available();
    Json(HealthResponse {
        status: if runtime_available { "ok" } else { "degraded" }.to_string(),
        supported_languages: vec![sandbox.profile().id.clone()],
        timestamp: chrono::Utc::now().to_rfc3339(),
        workers: Default::default(),
        timeout_ms: Some(sandbox.profile().timeout_ms),
        extra: serde_json::json!({
            "runtime": sandbox.runtime_program(),
            "runtimeAvailable": runtime_available,
            "maxConcurrent": sandbox.config().concurrency(),
            "activeExecutions": sandbox.active_executions(),
        })
        .as_object()
        .cloned()
        .unwrap_or_default(),
    })
}

async fn preflight_handler() -> StatusCode {
    StatusCode::OK
}

async fn fallback_handler(method: Method) -> Response {
    if method == Method::OPTIONS {
        return StatusCode::OK.into_response();
    }
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "Not found" })),
    )
        .into_response()
}
