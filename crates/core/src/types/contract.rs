//! HTTP contract shared by the gateway and every language worker.
//!
//! Both tiers expose the same `/execute` and `/health` shapes so the gateway
//! can treat every worker uniformly.

use serde::{Deserialize, Serialize};

use super::result::ExecutionResult;

/// Error text reported for a program killed by the wall-clock timer.
pub const TIMEOUT_MESSAGE: &str = "Execution timeout";

/// Error text reported for a cancelled execution.
pub const CANCELLED_MESSAGE: &str = "Execution cancelled";

/// Body of `POST /execute`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequestBody {
    /// Program source.
    pub code: Option<String>,
    /// Target language. Required by the gateway, ignored by workers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Standard input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    /// Bypass the gateway result cache.
    #[serde(default)]
    pub skip_cache: bool,
    /// Requested timeout; workers clamp it to their own ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Body returned by `POST /execute` for every completed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub output: String,
    pub error: Option<String>,
    pub execution_time: u64,
    pub exit_code: i32,
    #[serde(default)]
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub from_cache: bool,
}

impl ExecuteResponse {
    /// Render a result for the wire.
    ///
    /// Trailing line terminators are dropped from stdout unless the output was
    /// truncated, in which case the captured bytes are returned exactly.
    pub fn from_result(result: &ExecutionResult, language: Option<&str>) -> Self {
        let output = if result.truncated {
            result.stdout.clone()
        } else {
            result.stdout.trim_end_matches(['\n', '\r']).to_string()
        };

        let error = if result.timed_out {
            Some(TIMEOUT_MESSAGE.to_string())
        } else if result.cancelled {
            Some(CANCELLED_MESSAGE.to_string())
        } else {
            let stderr = result.stderr.trim_end();
            (!stderr.is_empty()).then(|| stderr.to_string())
        };

        Self {
            output,
            error,
            execution_time: result.duration_ms,
            exit_code: result.exit_code,
            request_id: result.request_id.clone(),
            language: language.map(str::to_string),
            timed_out: result.timed_out,
            truncated: result.truncated,
            cancelled: result.cancelled,
            from_cache: result.from_cache,
        }
    }

    /// Rebuild a result from a worker's response.
    pub fn into_result(self, request_id: impl Into<String>) -> ExecutionResult {
        let stderr = if self.timed_out || self.cancelled {
            String::new()
        } else {
            self.error.unwrap_or_default()
        };
        ExecutionResult {
            request_id: request_id.into(),
            stdout: self.output,
            stderr,
            exit_code: self.exit_code,
            duration_ms: self.execution_time,
            timed_out: self.timed_out,
            truncated: self.truncated,
            cancelled: self.cancelled,
            from_cache: self.from_cache,
        }
    }
}

/// Body returned by `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub supported_languages: Vec<String>,
    pub timestamp: String,
    /// Per-language worker availability (gateway only).
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub workers: std::collections::BTreeMap<String, WorkerStatus>,
    /// Timeout ceiling advertised by a worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Component-specific fields, flattened into the top-level object.
    #[serde(flatten, default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Availability of one language worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub available: bool,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Error body for non-200 responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable message.
    pub error: String,
    /// Stable error code.
    #[serde(default)]
    pub code: String,
    /// Language of the failed request, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_trims_trailing_newline() {
        let result = ExecutionResult::completed("r1", "hello\n", "", 0, 30);
        let response = ExecuteResponse::from_result(&result, Some("python"));
        assert_eq!(response.output, "hello");
        assert_eq!(response.error, None);
        assert_eq!(response.exit_code, 0);
    }

    #[test]
    fn test_truncated_output_is_byte_exact() {
        let mut result = ExecutionResult::completed("r1", "y\ny\n", "", 0, 30);
        result.truncated = true;
        let response = ExecuteResponse::from_result(&result, None);
        assert_eq!(response.output, "y\ny\n");
    }

    #[test]
    fn test_timeout_reports_message() {
        let result = ExecutionResult::timed_out("r1", 2001);
        let response = ExecuteResponse::from_result(&result, Some("javascript"));
        assert_eq!(response.error.as_deref(), Some(TIMEOUT_MESSAGE));
        assert!(response.timed_out);

        let back = response.into_result("r1");
        assert!(back.timed_out);
        assert!(back.stderr.is_empty());
    }

    #[test]
    fn test_camel_case_wire_names() {
        let result = ExecutionResult::completed("r1", "", "oops\n", 2, 5);
        let json = serde_json::to_value(ExecuteResponse::from_result(&result, None)).unwrap();
        assert_eq!(json["executionTime"], 5);
        assert_eq!(json["exitCode"], 2);
        assert_eq!(json["error"], "oops");
        assert_eq!(json["fromCache"], false);
    }

    #[test]
    fn test_request_body_rejects_non_string_code() {
        let parsed: std::result::Result<ExecuteRequestBody, _> =
            serde_json::from_str(r#"{"code": 42, "language": "python"}"#);
        assert!(parsed.is_err());
    }
}
