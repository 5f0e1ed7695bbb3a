//! Gateway router: validates requests and forwards them to language workers.
//!
//! Stateless. Every call resolves its language profile, enforces the payload
//! limit, and forwards to that language's [`WorkerClient`] under a hard
//! deadline of the profile timeout plus a grace period.

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use coderunner_core::config::{AppConfig, GatewayConfig};
use coderunner_core::{
    CodeExecutor, Error, ExecutionRequest, ExecutionResult, LanguageProfile, Result, WorkerStatus,
};

use crate::client::{EmbeddedWorker, HttpWorkerClient, WorkerClient};

struct Route {
    profile: LanguageProfile,
    client: Arc<dyn WorkerClient>,
}

/// Front door mapping language names to workers.
pub struct GatewayRouter {
    routes: Vec<Route>,
    by_name: HashMap<String, usize>,
    max_payload_bytes: usize,
    forward_grace: Duration,
    health_timeout: Duration,
}

impl GatewayRouter {
    /// Create an empty router.
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            routes: Vec::new(),
            by_name: HashMap::new(),
            max_payload_bytes: config.max_payload_bytes,
            forward_grace: Duration::from_millis(config.forward_grace_ms),
            health_timeout: Duration::from_millis(config.health_timeout_ms),
        }
    }

    /// Build a router for every configured language.
    ///
    /// Remote profiles get an [`HttpWorkerClient`]; `embedded` profiles get
    /// an [`EmbeddedWorker`] around the executor returned by `embed`.
    pub fn from_app_config<F>(config: &AppConfig, mut embed: F) -> Result<Self>
    where
        F: FnMut(&LanguageProfile) -> Result<EmbeddedWorker>,
    {
        let mut router = Self::new(&config.gateway);
        for profile in config.language_profiles() {
            let client: Arc<dyn WorkerClient> = if profile.is_embedded() {
                Arc::new(embed(&profile)?)
            } else {
                Arc::new(HttpWorkerClient::new(
                    profile.id.clone(),
                    profile.worker_address.clone(),
                )?)
            };
            router = router.register(profile, client)?;
        }
        Ok(router)
    }

    /// Serve `profile` through `client`.
    pub fn register(mut self, profile: LanguageProfile, client: Arc<dyn WorkerClient>) -> Result<Self> {
        let index = self.routes.len();
        let names = std::iter::once(profile.id.clone()).chain(profile.aliases.iter().cloned());
        for name in names {
            let name = normalize(&name);
            if let Some(existing) = self.by_name.insert(name.clone(), index) {
                return Err(Error::config(format!(
                    "language name '{}' is claimed by both {} and {}",
                    name, self.routes[existing].profile.id, profile.id
                )));
            }
        }
        tracing::debug!(
            language = %profile.id,
            address = %client.address(),
            "Registered language worker"
        );
        self.routes.push(Route { profile, client });
        Ok(self)
    }

    /// Largest accepted `code` or `stdin`, in bytes.
    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }

    /// Canonical language IDs, in registration order.
    pub fn supported_languages(&self) -> Vec<String> {
        self.routes.iter().map(|r| r.profile.id.clone()).collect()
    }

    /// Resolve a caller-supplied language name (case-insensitive, aliases allowed).
    pub fn resolve_language(&self, name: &str) -> Result<&LanguageProfile> {
        self.route(name).map(|r| &r.profile)
    }

    fn route(&self, name: &str) -> Result<&Route> {
        self.by_name
            .get(&normalize(name))
            .map(|&i| &self.routes[i])
            .ok_or_else(|| Error::unsupported_language(name.trim()))
    }

    /// Reject a request before any worker sees it.
    pub fn validate(&self, request: &ExecutionRequest) -> Result<&LanguageProfile> {
        if request.source_code.trim().is_empty() {
            return Err(Error::invalid_request("Code must be a non-empty string"));
        }
        if request.language.trim().is_empty() {
            return Err(Error::invalid_request("Language must be a non-empty string"));
        }
        let profile = self.resolve_language(&request.language)?;

        let stdin_len = request.stdin.as_ref().map_or(0, String::len);
        for size in [request.source_code.len(), stdin_len] {
            if size > self.max_payload_bytes {
                return Err(Error::PayloadTooLarge {
                    size,
                    limit: self.max_payload_bytes,
                });
            }
        }
        Ok(profile)
    }

    /// Validate and forward one request.
    ///
    /// The worker call is abandoned (its future dropped) once
    /// `timeout_ms + forward_grace` elapses, surfacing `WorkerTimeout`.
    pub async fn dispatch(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        self.validate(&request)?;
        let route = self.route(&request.language)?;
        let profile = &route.profile;
        let deadline = profile.timeout() + self.forward_grace;

        tracing::info!(
            request_id = %request.id,
            language = %profile.id,
            code_len = request.source_code.len(),
            "Dispatching execution"
        );

        match tokio::time::timeout(deadline, route.client.execute(&request, profile.timeout_ms)).await
        {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(Error::PayloadTooLarge { size, .. })) => Err(Error::PayloadTooLarge {
                size,
                limit: self.max_payload_bytes,
            }),
            Ok(Err(e)) => {
                tracing::warn!(request_id = %request.id, language = %profile.id, error = %e, "Worker call failed");
                Err(e)
            }
            Err(_) => {
                tracing::warn!(
                    request_id = %request.id,
                    language = %profile.id,
                    deadline_ms = deadline.as_millis() as u64,
                    "Worker call abandoned"
                );
                Err(Error::WorkerTimeout {
                    language: profile.id.clone(),
                    timeout_ms: profile.timeout_ms,
                })
            }
        }
    }

    /// Probe every worker concurrently.
    ///
    /// A worker that fails, times out or reports anything but `ok` is marked
    /// unavailable; the others are unaffected.
    pub async fn health(&self) -> BTreeMap<String, WorkerStatus> {
        let checks = self.routes.iter().map(|route| async move {
            let probe = tokio::time::timeout(self.health_timeout, route.client.health()).await;
            let (available, timeout_ms) = match probe {
                Ok(Ok(health)) => (health.status == "ok", health.timeout_ms),
                Ok(Err(e)) => {
                    tracing::debug!(language = %route.profile.id, error = %e, "Worker health check failed");
                    (false, None)
                }
                Err(_) => {
                    tracing::debug!(language = %route.profile.id, "Worker health check timed out");
                    (false, None)
                }
            };
            (
                route.profile.id.clone(),
                WorkerStatus {
                    available,
                    address: route.client.address().to_string(),
                    timeout_ms: timeout_ms.or(Some(route.profile.timeout_ms)),
                },
            )
        });

        join_all(checks).await.into_iter().collect()
    }
}

#[async_trait]
impl CodeExecutor for GatewayRouter {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        self.dispatch(request).await
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}
