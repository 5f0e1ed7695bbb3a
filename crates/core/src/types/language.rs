use serde::{Deserialize, Serialize};

/// Worker address meaning "run the sandbox inside this process".
pub const EMBEDDED_WORKER: &str = "embedded";

/// Static per-language execution profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LanguageProfile {
    /// Canonical language ID (e.g. "python"). Filled from the config key
    /// when omitted.
    #[serde(default)]
    pub id: String,

    /// Human-readable name.
    #[serde(default)]
    pub display_name: String,

    /// Base URL of the worker, or [`EMBEDDED_WORKER`].
    pub worker_address: String,

    /// Wall-clock ceiling for one execution.
    pub timeout_ms: u64,

    /// Memory ceiling handed to the runtime where it supports one.
    pub memory_limit_bytes: u64,

    /// Cap on captured stdout + stderr.
    pub max_output_bytes: usize,

    /// Alternative names accepted by the router.
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl LanguageProfile {
    /// Create a profile with the service defaults (256MB memory, 1MB output).
    pub fn new(id: impl Into<String>, worker_address: impl Into<String>, timeout_ms: u64) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            worker_address: worker_address.into(),
            timeout_ms,
            memory_limit_bytes: 256 * 1024 * 1024,
            max_output_bytes: 1024 * 1024,
            aliases: Vec::new(),
        }
    }

    /// Set the display name.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Set the output cap.
    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    /// Set the memory ceiling.
    pub fn with_memory_limit_bytes(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    /// Add accepted aliases.
    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases.extend(aliases.into_iter().map(Into::into));
        self
    }

    /// Whether `name` (already lowercased and trimmed) refers to this profile.
    pub fn matches(&self, name: &str) -> bool {
        self.id == name || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }

    /// Whether the sandbox runs inside the gateway process.
    pub fn is_embedded(&self) -> bool {
        self.worker_address == EMBEDDED_WORKER
    }

    /// Timeout as a `Duration`.
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}
