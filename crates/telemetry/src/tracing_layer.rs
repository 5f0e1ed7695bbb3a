//! Logging and distributed tracing configuration.

use coderunner_core::{Error, Result};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Configure stdout logging, plus OpenTelemetry export when
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
///
/// `service_name` tags exported spans (`coderunner-gateway`,
/// `coderunner-worker-python`, ...).
pub fn configure_tracing(service_name: &str, json_logs: bool) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,coderunner=debug".into()),
    );

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(tracing_subscriber::fmt::layer));

    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        let tracer_provider = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint.clone()),
            )
            .with_trace_config(
                sdktrace::config().with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.to_string(),
                )])),
            )
            .install_batch(runtime::Tokio)
            .map_err(|e| Error::internal(format!("Failed to install OTLP pipeline: {}", e)))?;
        let tracer = tracer_provider.tracer(service_name.to_string());

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        registry
            .with(otel_layer)
            .try_init()
            .map_err(|e| Error::internal(format!("Failed to install subscriber: {}", e)))?;
        tracing::info!(endpoint = %endpoint, service = service_name, "OpenTelemetry tracing enabled");
    } else {
        registry
            .try_init()
            .map_err(|e| Error::internal(format!("Failed to install subscriber: {}", e)))?;
    }

    Ok(())
}
