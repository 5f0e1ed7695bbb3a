#![deny(unused)]
//! Sandbox worker for CodeRunner.
//!
//! Executes one submitted program per request as an isolated child process
//! and returns its captured output. The isolation boundary is external to
//! the program: a separate OS process leading its own session, with rlimits,
//! a cleared environment and optionally reduced credentials. Every process
//! the program starts, including ones that leave its session, is killed when
//! the program exits or times out.
//!
//! # Lifecycle
//!
//! ```text
//!  Idle ──▶ Provisioning ──▶ Running ──▶ Finalizing ──▶ Idle
//!               │               ├──▶ TimedOut ──────▶ Idle
//!               │               └──▶ CrashExit ─────▶ Idle
//!               └──▶ Finalizing (workspace could not be created)
//! ```
//!
//! The workspace is removed on every path, including when the execution
//! future is dropped mid-run.
//!
//! # Usage
//!
//! ```ignore
//! use coderunner_sandbox::{ProcessSandbox, SandboxConfig};
//!
//! let sandbox = ProcessSandbox::new(SandboxConfig::from_app_config(&config)?)?;
//! let result = sandbox.run(ExecutionRequest::new("python", "print('hi')"), None).await?;
//! ```

pub mod capture;
pub mod engine;
pub mod limits;
pub mod runtime;
pub mod server;
pub mod workspace;

pub use engine::{ProcessSandbox, SandboxConfig, WorkerPhase};
pub use runtime::{RuntimeSpec, Step};
pub use server::WorkerServer;
pub use workspace::Workspace;
