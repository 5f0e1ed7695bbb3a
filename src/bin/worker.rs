#![deny(unused)]
//! CodeRunner sandbox worker.
//!
//! Serves exactly one language, chosen by `worker.language`, and runs each
//! submission as a short-lived child process in a throwaway workspace.

use std::sync::Arc;

use coderunner_core::config::AppConfig;
use coderunner_sandbox::{ProcessSandbox, SandboxConfig, WorkerServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    config.validate()?;

    let service = format!("coderunner-worker-{}", config.worker.language.to_lowercase());
    coderunner_telemetry::configure_tracing(&service, config.telemetry.json_logs)?;

    let sandbox = ProcessSandbox::new(SandboxConfig::from_app_config(&config)?)?;
    tracing::info!(
        language = %sandbox.profile().id,
        runtime = %sandbox.runtime_program(),
        available = sandbox.runtime_available(),
        max_concurrent = sandbox.config().concurrency(),
        "Starting CodeRunner worker v{}",
        env!("CARGO_PKG_VERSION")
    );
    if !sandbox.runtime_available() {
        tracing::warn!(
            runtime = %sandbox.runtime_program(),
            "Runtime not found on PATH; executions will fail until it is installed"
        );
    }

    let mut server = WorkerServer::new(config.server.clone(), Arc::new(sandbox));
    match coderunner_telemetry::setup_metrics_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(e) => tracing::warn!(error = %e, "Metrics disabled"),
    }

    server.run().await?;
    Ok(())
}
