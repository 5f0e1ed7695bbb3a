use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// =============================================================================
// Request Types
// =============================================================================

/// A single program submitted for execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    /// Unique request ID.
    pub id: String,

    /// Requested language name, as sent by the caller.
    pub language: String,

    /// Full program source.
    pub source_code: String,

    /// Optional standard input fed to the program.
    pub stdin: Option<String>,

    /// When the request was created.
    pub submitted_at: DateTime<Utc>,

    /// Bypass the result cache lookup (the fresh result is still stored).
    #[serde(default)]
    pub skip_cache: bool,
}

impl ExecutionRequest {
    /// Create a new request with a fresh ID.
    pub fn new(language: impl Into<String>, source_code: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            language: language.into(),
            source_code: source_code.into(),
            stdin: None,
            submitted_at: Utc::now(),
            skip_cache: false,
        }
    }

    /// Attach standard input.
    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// Skip the cache lookup for this request.
    pub fn skipping_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }

    /// Deterministic key over `(language, source, stdin)`.
    ///
    /// Fields are length-prefixed so `("a", "bc")` and `("ab", "c")` never
    /// collide. A missing stdin hashes like an empty one.
    pub fn cache_key(&self) -> CacheKey {
        let mut hasher = Sha256::new();
        for field in [
            self.language.trim().to_lowercase().as_bytes(),
            self.source_code.as_bytes(),
            self.stdin.as_deref().unwrap_or("").as_bytes(),
        ] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
        CacheKey(hasher.finalize().into())
    }
}

/// SHA-256 digest identifying an execution for memoization.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(pub [u8; 32]);

impl std::fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CacheKey({})", self)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
