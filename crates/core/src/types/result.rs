use serde::{Deserialize, Serialize};

/// Exit code reported when the process produced none (killed, never spawned).
pub const NO_EXIT_CODE: i32 = -1;

/// Outcome of one execution.
///
/// User-program failures (non-zero exit, timeout) live here rather than in
/// [`Error`](crate::Error): they are successful protocol responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// ID of the request this result answers.
    pub request_id: String,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Process exit code, or [`NO_EXIT_CODE`].
    pub exit_code: i32,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Killed by the wall-clock timer.
    pub timed_out: bool,
    /// Output hit the capture cap.
    pub truncated: bool,
    /// Cancelled by the caller before completion.
    pub cancelled: bool,
    /// Served from the result cache.
    pub from_cache: bool,
}

impl ExecutionResult {
    /// A completed execution.
    pub fn completed(
        request_id: impl Into<String>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        exit_code: i32,
        duration_ms: u64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
            duration_ms,
            timed_out: false,
            truncated: false,
            cancelled: false,
            from_cache: false,
        }
    }

    /// An execution abandoned at its timeout ceiling.
    pub fn timed_out(request_id: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            timed_out: true,
            ..Self::completed(request_id, "", "", NO_EXIT_CODE, duration_ms)
        }
    }

    /// An execution cancelled by the caller (running or still queued).
    pub fn cancelled(request_id: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            cancelled: true,
            ..Self::completed(request_id, "", "", NO_EXIT_CODE, duration_ms)
        }
    }

    /// Whether the program ran to completion with exit code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.cancelled
    }

    /// Whether this result may be memoized.
    pub fn is_cacheable(&self) -> bool {
        !self.timed_out && !self.cancelled
    }

    /// Copy of a stored result re-addressed to another request.
    pub fn replayed_for(&self, request_id: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            request_id: request_id.into(),
            duration_ms,
            from_cache: true,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_and_cacheability() {
        let ok = ExecutionResult::completed("r1", "hello\n", "", 0, 12);
        assert!(ok.success());
        assert!(ok.is_cacheable());

        let failed = ExecutionResult::completed("r2", "", "boom", 1, 12);
        assert!(!failed.success());
        assert!(failed.is_cacheable());

        let timeout = ExecutionResult::timed_out("r3", 2000);
        assert!(!timeout.success());
        assert!(!timeout.is_cacheable());
        assert_eq!(timeout.exit_code, NO_EXIT_CODE);

        assert!(!ExecutionResult::cancelled("r4", 0).is_cacheable());
    }

    #[test]
    fn test_replay_keeps_output() {
        let original = ExecutionResult::completed("r1", "42", "", 0, 900);
        let replay = original.replayed_for("r2", 1);
        assert_eq!(replay.request_id, "r2");
        assert_eq!(replay.stdout, "42");
        assert_eq!(replay.duration_ms, 1);
        assert!(replay.from_cache);
        assert!(!original.from_cache);
    }
}
