use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::types::LanguageProfile;
use crate::{Error, Result};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    pub cache: CacheConfig,
    pub languages: BTreeMap<String, LanguageProfile>,
    pub worker: WorkerConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Largest accepted `code` (and `stdin`) in bytes.
    pub max_payload_bytes: usize,
    /// Slack on top of a profile's timeout before the router abandons a worker.
    pub forward_grace_ms: u64,
    /// Per-worker health check timeout.
    pub health_timeout_ms: u64,
    /// Caller queues idle this long are dropped.
    pub queue_idle_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CacheConfig {
    /// Maximum stored results; 0 disables storage.
    pub capacity: usize,
    pub ttl_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Language served by `coderunner-worker`.
    pub language: String,
    /// Parent directory of per-request workspaces (defaults to the system temp dir).
    pub workspace_root: Option<PathBuf>,
    /// Concurrent child processes; 0 means one per available CPU.
    pub max_concurrent: usize,
    /// Drop privileges to this uid/gid before exec (requires root).
    pub run_as_uid: Option<u32>,
    pub run_as_gid: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct TelemetryConfig {
    pub json_logs: bool,
}

impl AppConfig {
    pub fn load() -> std::result::Result<Self, ConfigError> {
        let env = std::env::var("CODERUNNER_ENV").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(Config::try_from(&AppConfig::default())?)
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Map APP__SERVER__PORT=3001 to server.port
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }

    /// Language profiles with IDs filled in from their config keys.
    pub fn language_profiles(&self) -> Vec<LanguageProfile> {
        self.languages
            .iter()
            .map(|(key, profile)| {
                let mut profile = profile.clone();
                if profile.id.is_empty() {
                    profile.id = key.to_lowercase();
                }
                if profile.display_name.is_empty() {
                    profile.display_name = profile.id.clone();
                }
                profile
            })
            .collect()
    }

    /// Look up one profile by canonical ID.
    pub fn language(&self, id: &str) -> Option<LanguageProfile> {
        self.language_profiles().into_iter().find(|p| p.id == id)
    }

    /// Reject configurations that could never serve a request.
    pub fn validate(&self) -> Result<()> {
        if self.gateway.max_payload_bytes == 0 {
            return Err(Error::config("gateway.max_payload_bytes must be > 0"));
        }
        for profile in self.language_profiles() {
            if profile.timeout_ms == 0 {
                return Err(Error::config(format!("{}: timeout_ms must be > 0", profile.id)));
            }
            if profile.max_output_bytes == 0 {
                return Err(Error::config(format!(
                    "{}: max_output_bytes must be > 0",
                    profile.id
                )));
            }
            if !profile.is_embedded() {
                let url = url::Url::parse(&profile.worker_address).map_err(|e| {
                    Error::config(format!(
                        "{}: invalid worker_address '{}': {}",
                        profile.id, profile.worker_address, e
                    ))
                })?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(Error::config(format!(
                        "{}: worker_address must be http(s) or 'embedded'",
                        profile.id
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let languages = [
            ("javascript", "JavaScript", 10_000, &["js", "node"][..]),
            ("python", "Python", 10_000, &["py", "python3"][..]),
            ("java", "Java", 15_000, &[][..]),
            ("cpp", "C++", 15_000, &["c++"][..]),
            ("php", "PHP", 10_000, &[][..]),
            ("ruby", "Ruby", 10_000, &["rb"][..]),
            ("go", "Go", 15_000, &["golang"][..]),
            ("rust", "Rust", 20_000, &["rs"][..]),
            ("typescript", "TypeScript", 10_000, &["ts"][..]),
        ]
        .into_iter()
        .map(|(id, name, timeout_ms, aliases)| {
            let profile = LanguageProfile::new(id, format!("http://sandbox-{}:8080", id), timeout_ms)
                .with_display_name(name)
                .with_aliases(aliases.iter().copied());
            (id.to_string(), profile)
        })
        .collect();

        Self {
            server: ServerConfig {
                host: "0.0.0.0".into(),
                port: 3001,
            },
            gateway: GatewayConfig {
                max_payload_bytes: 1024 * 1024,
                forward_grace_ms: 250,
                health_timeout_ms: 2000,
                queue_idle_secs: 300,
            },
            cache: CacheConfig {
                capacity: 50,
                ttl_secs: 300,
            },
            languages,
            worker: WorkerConfig {
                language: "python".into(),
                workspace_root: None,
                max_concurrent: 0,
                run_as_uid: None,
                run_as_gid: None,
            },
            telemetry: TelemetryConfig::default(),
        }
    }
}
