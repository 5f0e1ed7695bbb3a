//! Error types for CodeRunner.
//!
//! Failures of the *submitted program* (non-zero exit, compile error,
//! timeout) are never errors: they travel in-band inside an
//! [`ExecutionResult`](crate::types::ExecutionResult). Everything here is
//! either a rejected request or a failure of the execution infrastructure.

use thiserror::Error;

/// Result type alias using CodeRunner's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for CodeRunner.
///
/// `Clone` so a single in-flight failure can be handed to every caller
/// waiting on the same cache key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // =========================================================================
    // Request Errors (4xx)
    // =========================================================================
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    // =========================================================================
    // Worker Errors (infrastructure)
    // =========================================================================
    #[error("Could not connect to the {language} sandbox service: {reason}")]
    WorkerUnreachable { language: String, reason: String },

    #[error("The {language} sandbox did not answer within {timeout_ms}ms")]
    WorkerTimeout { language: String, timeout_ms: u64 },

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Runtime '{0}' is not installed on this worker")]
    RuntimeMissing(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    // =========================================================================
    // Generic Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid request error.
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create an unsupported language error.
    pub fn unsupported_language(language: impl Into<String>) -> Self {
        Self::UnsupportedLanguage(language.into())
    }

    /// Create a worker unreachable error.
    pub fn worker_unreachable(language: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::WorkerUnreachable {
            language: language.into(),
            reason: reason.into(),
        }
    }

    /// Create a worker error.
    pub fn worker(msg: impl Into<String>) -> Self {
        Self::Worker(msg.into())
    }

    /// Create a workspace error.
    pub fn workspace(msg: impl Into<String>) -> Self {
        Self::Workspace(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::UnsupportedLanguage(_) => "UNSUPPORTED_LANGUAGE",
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::WorkerUnreachable { .. } => "WORKER_UNREACHABLE",
            Self::WorkerTimeout { .. } => "WORKER_TIMEOUT",
            Self::Worker(_) => "WORKER_ERROR",
            Self::RuntimeMissing(_) => "RUNTIME_MISSING",
            Self::Workspace(_) => "WORKSPACE_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller sent something the service will never accept.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest(_) | Self::UnsupportedLanguage(_) | Self::PayloadTooLarge { .. }
        )
    }

    /// HTTP status both servers answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::PayloadTooLarge { .. } => 413,
            e if e.is_client_error() => 400,
            _ => 500,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
