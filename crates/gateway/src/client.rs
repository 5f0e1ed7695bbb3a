//! Transports from the gateway to language workers.
//!
//! A [`WorkerClient`] either talks HTTP to a remote worker
//! ([`HttpWorkerClient`]) or calls an in-process executor
//! ([`EmbeddedWorker`]). Dropping an `execute` future abandons the call.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use coderunner_core::{
    CodeExecutor, Error, ErrorResponse, ExecuteRequestBody, ExecuteResponse, ExecutionRequest,
    ExecutionResult, HealthResponse, Result, EMBEDDED_WORKER,
};

/// Transport to one language worker.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Forward one request; `timeout_ms` is the profile ceiling.
    async fn execute(&self, request: &ExecutionRequest, timeout_ms: u64) -> Result<ExecutionResult>;

    /// Ask the worker for its health document.
    async fn health(&self) -> Result<HealthResponse>;

    /// Address shown in the gateway health report.
    fn address(&self) -> &str;
}

// =============================================================================
// HTTP Worker
// =============================================================================

/// Worker reached over HTTP at `<base>/execute` and `<base>/health`.
pub struct HttpWorkerClient {
    language: String,
    address: String,
    execute_url: Url,
    health_url: Url,
    client: reqwest::Client,
}

impl HttpWorkerClient {
    /// Create a client for the worker at `address`.
    pub fn new(language: impl Into<String>, address: impl Into<String>) -> Result<Self> {
        let language = language.into();
        let address = address.into();
        let base = Url::parse(&format!("{}/", address.trim_end_matches('/'))).map_err(|e| {
            Error::config(format!("invalid worker address '{}': {}", address, e))
        })?;
        let join = |path: &str| {
            base.join(path)
                .map_err(|e| Error::config(format!("invalid worker address '{}': {}", address, e)))
        };
        let execute_url = join("execute")?;
        let health_url = join("health")?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            language,
            address,
            execute_url,
            health_url,
            client,
        })
    }

    fn transport_error(&self, e: reqwest::Error, timeout_ms: u64) -> Error {
        if e.is_timeout() {
            Error::WorkerTimeout {
                language: self.language.clone(),
                timeout_ms,
            }
        } else if e.is_connect() || e.is_request() {
            Error::worker_unreachable(self.language.clone(), e.to_string())
        } else {
            Error::worker(format!("{} worker: {}", self.language, e))
        }
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn execute(&self, request: &ExecutionRequest, timeout_ms: u64) -> Result<ExecutionResult> {
        let body = ExecuteRequestBody {
            code: Some(request.source_code.clone()),
            language: Some(self.language.clone()),
            stdin: request.stdin.clone(),
            skip_cache: false,
            timeout_ms: Some(timeout_ms),
        };

        tracing::debug!(
            request_id = %request.id,
            language = %self.language,
            url = %self.execute_url,
            "Forwarding to worker"
        );

        let response = self
            .client
            .post(self.execute_url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e, timeout_ms))?;

        let status = response.status();
        if status.is_success() {
            let parsed: ExecuteResponse = response
                .json()
                .await
                .map_err(|e| Error::worker(format!("{} worker sent an invalid body: {}", self.language, e)))?;
            return Ok(parsed.into_result(request.id.clone()));
        }

        let message = response
            .json::<ErrorResponse>()
            .await
            .map(|body| body.error)
            .unwrap_or_else(|_| status.to_string());

        Err(match status {
            StatusCode::BAD_REQUEST => Error::invalid_request(message),
            StatusCode::PAYLOAD_TOO_LARGE => Error::PayloadTooLarge {
                size: request.source_code.len(),
                limit: 0,
            },
            _ => Error::worker(format!("{} worker answered {}: {}", self.language, status, message)),
        })
    }

    async fn health(&self) -> Result<HealthResponse> {
        let response = self
            .client
            .get(self.health_url.clone())
            .send()
            .await
            .map_err(|e| Error::worker_unreachable(self.language.clone(), e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::worker(format!(
                "{} worker health answered {}",
                self.language,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::worker(format!("{} worker sent an invalid health body: {}", self.language, e)))
    }

    fn address(&self) -> &str {
        &self.address
    }
}

// =============================================================================
// Embedded Worker
// =============================================================================

/// Worker hosted inside the gateway process.
pub struct EmbeddedWorker {
    language: String,
    executor: Arc<dyn CodeExecutor>,
    probe: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
}

impl EmbeddedWorker {
    /// Wrap an in-process executor.
    pub fn new(language: impl Into<String>, executor: Arc<dyn CodeExecutor>) -> Self {
        Self {
            language: language.into(),
            executor,
            probe: None,
        }
    }

    /// Report availability through `probe` (e.g. "runtime binary found").
    pub fn with_availability<F>(mut self, probe: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.probe = Some(Arc::new(probe));
        self
    }
}

#[async_trait]
impl WorkerClient for EmbeddedWorker {
    async fn execute(&self, request: &ExecutionRequest, _timeout_ms: u64) -> Result<ExecutionResult> {
        self.executor.execute(request.clone()).await
    }

    async fn health(&self) -> Result<HealthResponse> {
        let available = self.probe.as_ref().map_or(true, |probe| probe());
        Ok(HealthResponse {
            status: if available { "ok" } else { "degraded" }.to_string(),
            supported_languages: vec![self.language.clone()],
            timestamp: chrono::Utc::now().to_rfc3339(),
            workers: Default::default(),
            timeout_ms: None,
            extra: Default::default(),
        })
    }

    fn address(&self) -> &str {
        EMBEDDED_WORKER
    }
}
