#![deny(unused)]
//! Observability for CodeRunner.
//!
//! - Structured logging and optional OTLP trace export
//! - Prometheus metrics for HTTP traffic, executions and the result cache

pub mod http;
pub mod metrics;
pub mod tracing_layer;

pub use self::metrics::{
    setup_metrics_recorder, track_cache, track_execution, track_request, ExecutionOutcome,
};
pub use self::http::track_http;
pub use tracing_layer::configure_tracing;
