//! git2kv configuration file handling

use super::repo_config::RepoConfig;
use crate::kv::KvStore;
use crate::{Git2KvError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// KV key the configuration document is read from in `--config-key` mode
pub const DEFAULT_CONFIG_KEY: &str = "git2consul/config";

/// KV store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    /// Consul agent HTTP endpoint
    #[serde(default = "default_kv_endpoint")]
    pub endpoint: String,

    /// ACL token, literal or `$ENV_VAR` reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Retries for transient failures of a single KV request
    #[serde(default = "default_kv_retries")]
    pub retries: u32,

    /// Per-request HTTP timeout in seconds
    #[serde(default = "default_kv_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_kv_endpoint() -> String {
    "http://127.0.0.1:8500".to_string()
}

fn default_kv_retries() -> u32 {
    3
}

fn default_kv_request_timeout() -> u64 {
    10
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            endpoint: default_kv_endpoint(),
            token: None,
            retries: default_kv_retries(),
            request_timeout_secs: default_kv_request_timeout(),
        }
    }
}

impl KvConfig {
    /// The ACL token with `$ENV_VAR` references resolved
    pub fn resolved_token(&self) -> Option<String> {
        self.token.as_deref().and_then(resolve_secret)
    }

    /// Per-request HTTP timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// git2kv configuration
///
/// Represents the complete config file: storage location, KV connection,
/// sync tuning and the list of mirrored repositories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Git2KvConfig {
    /// Root directory for branch working copies (`<local_store>/<repo>/<branch>`)
    #[serde(default = "default_local_store")]
    pub local_store: PathBuf,

    /// Upper bound for one record operation (file read + KV write/delete)
    #[serde(default = "default_record_timeout")]
    pub record_timeout_secs: u64,

    /// Maximum record operations in flight within one sync cycle
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Port serving `/metrics` and `/health`; disabled when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,

    /// KV store connection
    #[serde(default)]
    pub kv: KvConfig,

    /// Mirrored repositories
    #[serde(default)]
    pub repos: Vec<RepoConfig>,
}

fn default_local_store() -> PathBuf {
    let mut path = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("git2kv");
    path
}

fn default_record_timeout() -> u64 {
    30
}

fn default_max_in_flight() -> usize {
    32
}

impl Git2KvConfig {
    /// Create an empty configuration rooted at `local_store`
    pub fn new(local_store: impl Into<PathBuf>) -> Self {
        Self {
            local_store: local_store.into(),
            record_timeout_secs: default_record_timeout(),
            max_in_flight: default_max_in_flight(),
            metrics_port: None,
            kv: KvConfig::default(),
            repos: Vec::new(),
        }
    }

    /// Load configuration from the default path
    pub fn load_default() -> Result<Self> {
        Self::load(Self::default_path())
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(crate::Git2KvError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading git2kv configuration");

        let content = fs::read_to_string(path)?;
        let config = Self::from_yaml(&content)?;

        tracing::debug!(
            repos = config.repos.len(),
            kv = %config.kv.endpoint,
            local_store = %config.local_store.display(),
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Load configuration stored under `key` in the KV store.
    ///
    /// The document may be YAML or JSON.
    pub async fn load_from_kv(kv: &dyn KvStore, key: &str) -> Result<Self> {
        tracing::info!(key, "Loading git2kv configuration from KV");

        let bytes = kv.get(key).await?.ok_or_else(|| {
            Git2KvError::Config(format!("No configuration found at KV key {}", key))
        })?;
        let content = String::from_utf8(bytes).map_err(|_| {
            Git2KvError::Config(format!("Configuration at KV key {} is not UTF-8", key))
        })?;

        let config = Self::from_yaml(&content)?;
        tracing::debug!(repos = config.repos.len(), "Configuration loaded from KV");
        Ok(config)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Default config path (`~/.config/git2kv/config.yaml`)
    pub fn default_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".config");
        path.push("git2kv");
        path.push("config.yaml");
        path
    }

    /// Add a repository
    pub fn add_repo(&mut self, repo: RepoConfig) {
        self.repos.push(repo);
    }

    /// Get a repository by name
    pub fn get_repo(&self, name: &str) -> Option<&RepoConfig> {
        self.repos.iter().find(|r| r.name == name)
    }

    /// Upper bound for a single record operation
    pub fn record_timeout(&self) -> Duration {
        Duration::from_secs(self.record_timeout_secs)
    }
}

/// Resolve a secret that is either a literal or a `$ENV_VAR` reference.
///
/// Returns `None` for empty values and for references to unset variables.
pub fn resolve_secret(value: &str) -> Option<String> {
    let resolved = match value.strip_prefix('$') {
        Some(var) => match std::env::var(var) {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(env_var = %var, "Secret references an unset environment variable");
                return None;
            }
        },
        None => value.to_string(),
    };

    if resolved.is_empty() {
        None
    } else {
        Some(resolved)
    }
}
