//! Core traits for CodeRunner.
//!
//! These traits define the seams between the queue, the router and the
//! sandbox, so each layer can be swapped or mocked independently.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ExecutionRequest, ExecutionResult};

/// Anything that turns a request into a result.
///
/// Implemented by the sandbox worker (runs the program), the gateway router
/// (forwards to a worker) and test mocks. Dropping the returned future must
/// abandon the execution: implementations that own processes kill them.
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    /// Execute one request.
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult>;
}
