#![deny(unused)]
//! Gateway for CodeRunner.
//!
//! This crate provides the HTTP entry point of the system: language routing
//! to sandbox workers, the result cache and per-caller execution queues.
//!
//! ```text
//! caller ─▶ GatewayServer ─▶ QueueRegistry ─▶ ExecutionQueue ─┐
//!                  │                                          ▼
//!                  └──────── (no x-client-id) ──────────▶ ResultCache
//!                                                             │ miss
//!                                                             ▼
//!                                                      GatewayRouter
//!                                                             │
//!                                         HttpWorkerClient / EmbeddedWorker
//! ```

pub mod cache;
pub mod client;
pub mod queue;
pub mod router;
pub mod scheduler;
pub mod server;

pub use cache::{CacheStats, ResultCache};
pub use client::{EmbeddedWorker, HttpWorkerClient, WorkerClient};
pub use queue::{execute_cached, CancelSummary, ExecutionQueue, QueueStatus};
pub use router::GatewayRouter;
pub use scheduler::QueueRegistry;
pub use server::{AppState, GatewayServer, CLIENT_ID_HEADER};
