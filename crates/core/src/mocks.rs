//! Mock implementations of core traits for testing.
//!
//! Shared by the unit and integration tests of every crate in the workspace.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::{
    traits::CodeExecutor,
    types::{ExecutionRequest, ExecutionResult},
    Error, Result,
};

// =============================================================================
// Mock Executor
// =============================================================================

/// Scripted executor that echoes the submitted source as stdout.
///
/// Records the source of every call in order, so tests can assert on FIFO
/// ordering and on how many executions actually happened.
pub struct MockExecutor {
    delay: Duration,
    failure: Option<Error>,
    exit_code: i32,
    calls: Mutex<Vec<String>>,
    started: AtomicUsize,
    finished: AtomicUsize,
}

impl MockExecutor {
    /// Create a mock that answers instantly with exit code 0.
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            failure: None,
            exit_code: 0,
            calls: Mutex::new(Vec::new()),
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        }
    }

    /// Sleep this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Answer every call with this error.
    pub fn failing(mut self, error: Error) -> Self {
        self.failure = Some(error);
        self
    }

    /// Report this exit code.
    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = exit_code;
        self
    }

    /// Sources of every call, in the order they started.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of executions that started.
    pub fn call_count(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Number of executions that ran to completion (were not dropped).
    pub fn finished_count(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CodeExecutor for MockExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        self.calls.lock().unwrap().push(request.source_code.clone());
        self.started.fetch_add(1, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.finished.fetch_add(1, Ordering::SeqCst);

        if let Some(ref error) = self.failure {
            return Err(error.clone());
        }

        Ok(ExecutionResult::completed(
            request.id,
            format!("{}\n", request.source_code),
            "",
            self.exit_code,
            self.delay.as_millis() as u64,
        ))
    }
}
