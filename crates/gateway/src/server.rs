//! Axum-based HTTP server for the gateway.

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Json, State},
    http::{HeaderMap, Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use coderunner_core::{
    config::ServerConfig, Error, ErrorResponse, ExecuteRequestBody, ExecuteResponse,
    ExecutionRequest, ExecutionResult, HealthResponse, Result,
};
use coderunner_telemetry::track_http;

use crate::cache::ResultCache;
use crate::queue::{execute_cached, CancelSummary, QueueStatus};
use crate::router::GatewayRouter;
use crate::scheduler::QueueRegistry;

/// Header naming the caller whose queue a request joins.
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// How often expired cache entries and idle queues are swept.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<GatewayRouter>,
    pub cache: Arc<ResultCache>,
    pub queues: Arc<QueueRegistry>,
}

/// Gateway server.
pub struct GatewayServer {
    config: ServerConfig,
    state: AppState,
    queue_idle: Duration,
    metrics_handle: Option<PrometheusHandle>,
}

impl GatewayServer {
    /// Create a new gateway server. Caller queues share `cache` and execute
    /// through `router`.
    pub fn new(config: ServerConfig, router: Arc<GatewayRouter>, cache: Arc<ResultCache>) -> Self {
        let queues = Arc::new(QueueRegistry::new(router.clone(), cache.clone()));
        Self {
            config,
            state: AppState {
                router,
                cache,
                queues,
            },
            queue_idle: Duration::from_secs(300),
            metrics_handle: None,
        }
    }

    /// Drop caller queues idle for longer than this.
    pub fn with_queue_idle(mut self, idle: Duration) -> Self {
        self.queue_idle = idle;
        self
    }

    /// Set metrics handle.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Build the Axum router.
    pub fn build_router(&self) -> Router {
        // Headroom for JSON escaping; the router enforces the real limit.
        let body_limit = self.state.router.max_payload_bytes() * 2 + 64 * 1024;

        let mut router = Router::new()
            .route("/execute", post(execute_handler).options(preflight_handler))
            .route("/health", get(health_handler).options(preflight_handler))
            .route("/cancel", post(cancel_handler).options(preflight_handler))
            .route("/queue", get(queue_handler).options(preflight_handler))
            .route("/cache", delete(clear_cache_handler).options(preflight_handler));

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
                    .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                    .allow_headers(Any),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Periodically purge expired cache entries and prune idle queues.
    pub fn spawn_maintenance(&self, every: Duration) -> JoinHandle<()> {
        let state = self.state.clone();
        let idle = self.queue_idle;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let purged = state.cache.purge_expired();
                let pruned = state.queues.prune_idle(idle);
                if purged > 0 || pruned > 0 {
                    tracing::debug!(purged, pruned, "Maintenance sweep");
                }
            }
        })
    }

    /// Run the server.
    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::internal(format!("Failed to bind {}: {}", addr, e)))?;

        tracing::info!(
            addr = %addr,
            languages = ?self.state.router.supported_languages(),
            "Gateway server starting"
        );

        let maintenance = self.spawn_maintenance(MAINTENANCE_INTERVAL);
        let served = axum::serve(listener, self.build_router()).await;
        maintenance.abort();

        served.map_err(|e| Error::internal(format!("Server error: {}", e)))
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Error rendered as `{error, code, language?}` with the matching status.
struct ApiError {
    error: Error,
    language: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.error.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.error, code = self.error.code(), "Request failed");
        }
        let body = ErrorResponse {
            error: self.error.to_string(),
            code: self.error.code().to_string(),
            language: self.language,
        };
        (status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self {
            error,
            language: None,
        }
    }
}

/// Malformed JSON and non-string fields are 400s; a body over the transport
/// limit is a 413.
fn rejection_response(rejection: JsonRejection) -> Response {
    let (status, code) = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE")
    } else {
        (StatusCode::BAD_REQUEST, "INVALID_REQUEST")
    };
    let body = ErrorResponse {
        error: rejection.body_text(),
        code: code.to_string(),
        language: None,
    };
    (status, Json(body)).into_response()
}

fn client_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn require_client_id(headers: &HeaderMap) -> std::result::Result<String, ApiError> {
    client_id(headers).ok_or_else(|| {
        Error::invalid_request(format!("{} header is required", CLIENT_ID_HEADER)).into()
    })
}

// =============================================================================
// Handlers
// =============================================================================

async fn execute_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: std::result::Result<Json<ExecuteRequestBody>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => return rejection_response(rejection),
    };
    let requested_language = body.language.as_deref().map(|l| l.trim().to_string());

    let request = match build_request(&state.router, body) {
        Ok(request) => request,
        Err(error) => {
            return ApiError {
                error,
                language: requested_language,
            }
            .into_response()
        }
    };
    let language = request.language.clone();
    let request_id = request.id.clone();

    let outcome = match client_id(&headers) {
        Some(client) => {
            tracing::debug!(request_id = %request_id, client_id = %client, "Queueing execution");
            state.queues.get_or_create(&client).submit(request).await
        }
        None => execute_cached(&state.cache, state.router.as_ref(), request).await,
    };

    match outcome {
        Ok(result) => Json(ExecuteResponse::from_result(&result, Some(&language))).into_response(),
        // A stuck worker is still a completed execution from the caller's view.
        Err(Error::WorkerTimeout { .. }) => {
            let result = ExecutionResult::timed_out(&request_id, started.elapsed().as_millis() as u64);
            Json(ExecuteResponse::from_result(&result, Some(&language))).into_response()
        }
        Err(error) => ApiError {
            error,
            language: Some(language),
        }
        .into_response(),
    }
}

/// Turn the wire body into a validated request with its canonical language.
fn build_request(router: &GatewayRouter, body: ExecuteRequestBody) -> Result<ExecutionRequest> {
    let code = body
        .code
        .ok_or_else(|| Error::invalid_request("Code must be a non-empty string"))?;
    let language = body
        .language
        .ok_or_else(|| Error::invalid_request("Language must be a non-empty string"))?;

    let mut request = ExecutionRequest::new(language, code);
    request.stdin = body.stdin;
    request.skip_cache = body.skip_cache;

    request.language = router.validate(&request)?.id.clone();
    Ok(request)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let workers = state.router.health().await;

    let mut extra = serde_json::Map::new();
    extra.insert(
        "cache".to_string(),
        serde_json::to_value(state.cache.stats()).unwrap_or_default(),
    );
    extra.insert("queues".to_string(), serde_json::json!(state.queues.len()));

    Json(HealthResponse {
        status: "ok".to_string(),
        supported_languages: state.router.supported_languages(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        workers,
        timeout_ms: None,
        extra,
    })
}

async fn cancel_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Json<CancelSummary>, ApiError> {
    let client = require_client_id(&headers)?;
    let summary = state
        .queues
        .get(&client)
        .map(|queue| queue.cancel())
        .unwrap_or_default();
    Ok(Json(summary))
}

async fn queue_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Json<QueueStatus>, ApiError> {
    let client = require_client_id(&headers)?;
    let status = state
        .queues
        .get(&client)
        .map(|queue| queue.status())
        .unwrap_or_default();
    Ok(Json(status))
}

async fn clear_cache_handler(State(state): State<AppState>) -> StatusCode {
    state.cache.clear();
    tracing::info!("Result cache cleared");
    StatusCode::NO_CONTENT
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
