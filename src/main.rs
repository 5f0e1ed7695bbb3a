#![deny(unused)]
//! CodeRunner gateway.
//!
//! Accepts execution requests over HTTP, validates them, and forwards each
//! one to the sandbox worker for its language. Identical requests are served
//! from a shared result cache; callers that send `x-client-id` get a private
//! FIFO queue they can inspect and cancel.

use std::sync::Arc;
use std::time::Duration;

use coderunner_core::config::AppConfig;
use coderunner_gateway::{EmbeddedWorker, GatewayRouter, GatewayServer, ResultCache};
use coderunner_sandbox::{ProcessSandbox, SandboxConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    config.validate()?;

    coderunner_telemetry::configure_tracing("coderunner-gateway", config.telemetry.json_logs)?;
    tracing::info!("Starting CodeRunner gateway v{}", env!("CARGO_PKG_VERSION"));

    // =========================================================================
    // Language workers
    // =========================================================================
    let router = GatewayRouter::from_app_config(&config, |profile| {
        let sandbox = Arc::new(ProcessSandbox::new(SandboxConfig::for_profile(
            &config,
            profile.clone(),
        )?)?);
        let probe = sandbox.clone();
        tracing::info!(
            language = %profile.id,
            runtime = %sandbox.runtime_program(),
            "Running language in-process"
        );
        Ok(EmbeddedWorker::new(profile.id.clone(), sandbox)
            .with_availability(move || probe.runtime_available()))
    })?;

    for (language, status) in router.health().await {
        if status.available {
            tracing::info!(language = %language, address = %status.address, "Worker ready");
        } else {
            tracing::warn!(language = %language, address = %status.address, "Worker not reachable yet");
        }
    }

    // =========================================================================
    // Cache & server
    // =========================================================================
    let cache = Arc::new(ResultCache::new(
        config.cache.capacity,
        Duration::from_secs(config.cache.ttl_secs),
    ));

    let mut server = GatewayServer::new(config.server.clone(), Arc::new(router), cache)
        .with_queue_idle(Duration::from_secs(config.gateway.queue_idle_secs));

    match coderunner_telemetry::setup_metrics_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(e) => tracing::warn!(error = %e, "Metrics disabled"),
    }

    server.run().await?;
    Ok(())
}
