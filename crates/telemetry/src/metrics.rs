//! Metrics implementation using Prometheus.

use coderunner_core::{Error, ExecutionResult, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Initialize Prometheus recorder and return the handle.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::internal(format!("Failed to install Prometheus recorder: {}", e)))?;

    tracing::info!("Prometheus metrics recorder initialized");
    Ok(handle)
}

/// Helper to track HTTP request metrics (latency, count).
pub fn track_request(method: &str, path: &str, status: u16, latency_sec: f64) {
    metrics::counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "http_request_duration_seconds",
        "method" => method.to_string(),
        "path" => path.to_string()
    )
    .record(latency_sec);
}

/// Coarse classification of a finished execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success,
    NonZeroExit,
    TimedOut,
    Cancelled,
    Failed,
}

impl ExecutionOutcome {
    /// Classify a result.
    pub fn of(result: &ExecutionResult) -> Self {
        if result.cancelled {
            Self::Cancelled
        } else if result.timed_out {
            Self::TimedOut
        } else if result.exit_code == 0 {
            Self::Success
        } else {
            Self::NonZeroExit
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NonZeroExit => "non_zero_exit",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

/// Helper to track one execution (count and duration per language).
pub fn track_execution(language: &str, outcome: ExecutionOutcome, duration_ms: u64) {
    metrics::counter!(
        "executions_total",
        "language" => language.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);

    metrics::histogram!("execution_duration_seconds", "language" => language.to_string())
        .record(duration_ms as f64 / 1000.0);
}

/// Helper to track result cache lookups.
pub fn track_cache(hit: bool) {
    metrics::counter!("result_cache_lookups_total", "result" => if hit { "hit" } else { "miss" })
        .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_classification() {
        let ok = ExecutionResult::completed("r", "", "", 0, 1);
        assert_eq!(ExecutionOutcome::of(&ok), ExecutionOutcome::Success);

        let failed = ExecutionResult::completed("r", "", "", 3, 1);
        assert_eq!(ExecutionOutcome::of(&failed), ExecutionOutcome::NonZeroExit);

        let timeout = ExecutionResult::timed_out("r", 1);
        assert_eq!(ExecutionOutcome::of(&timeout), ExecutionOutcome::TimedOut);

        let cancelled = ExecutionResult::cancelled("r", 1);
        assert_eq!(ExecutionOutcome::of(&cancelled), ExecutionOutcome::Cancelled);
    }
}
