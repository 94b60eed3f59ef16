//! Configuration file of the `cloudshelf` binary.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use cloudshelf_common::{BackoffConfig, FileTypeConfig, ModelConfig, SyncConfig};
use cloudshelf_proxy::CacheConfig;
use cloudshelf_sync::{ReconcileConfig, DEFAULT_RECONCILE_LIMIT};

/// Where the binary keeps its state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub database: PathBuf,
    /// Root of the host file store; one subdirectory per entity type.
    pub filestore: PathBuf,
    pub cache_dir: PathBuf,
    pub credential_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let data = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cloudshelf");
        let cache = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cloudshelf");

        Self {
            database: data.join("cloudshelf.db"),
            filestore: data.join("filestore"),
            cache_dir: cache.join("blobs"),
            credential_file: data.join("credential.json"),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Externally visible base URL, when it differs from the bind address.
    pub public_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8640".to_string(),
            public_url: None,
        }
    }
}

impl ServerConfig {
    /// Redirect URI registered with the OAuth client.
    pub fn redirect_uri(&self) -> String {
        let base = self
            .public_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.bind));
        format!("{}/oauth/callback", base.trim_end_matches('/'))
    }
}

/// OAuth client registration used to seed a new credential.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
}

/// Retry budget for remote calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub call_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            call_timeout_secs: 60,
        }
    }
}

impl RetryConfig {
    pub fn to_backoff(&self) -> BackoffConfig {
        BackoffConfig::new(self.max_attempts)
            .with_base_delay(Duration::from_millis(self.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_call_timeout(Duration::from_secs(self.call_timeout_secs))
    }
}

/// Periodic work of `cloudshelf auto`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub reconcile_every_secs: u64,
    pub reconcile_limit: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            reconcile_every_secs: 3600,
            reconcile_limit: DEFAULT_RECONCILE_LIMIT,
        }
    }
}

/// Complete configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub server: ServerConfig,
    pub oauth: OAuthClientConfig,
    pub sync: SyncConfig,
    pub models: Vec<ModelConfig>,
    /// Whitelist; the built-in defaults apply when empty.
    pub file_types: Vec<FileTypeConfig>,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub reconcile: ReconcileConfig,
    pub schedule: ScheduleConfig,
    /// Caller identity to readable entity types; `*` matches any.
    pub access: HashMap<String, Vec<String>>,
}

impl AppConfig {
    /// Default location of the configuration file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cloudshelf")
            .join("config.json")
    }

    /// Starting point written by `cloudshelf init`.
    pub fn example() -> Self {
        Self {
            models: vec![ModelConfig::new("invoice", "Invoices")],
            ..Self::default()
        }
    }

    /// Load from `path`, or defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Write as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }

    pub fn effective_file_types(&self) -> Vec<FileTypeConfig> {
        if self.file_types.is_empty() {
            FileTypeConfig::defaults()
        } else {
            self.file_types.clone()
        }
    }

    /// Entity types with an active model config, deduplicated.
    pub fn entity_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .models
            .iter()
            .filter(|m| m.is_active)
            .map(|m| m.entity_type.clone())
            .collect();
        types.sort();
        types.dedup();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        let config = AppConfig::load(&temp.path().join("absent.json")).unwrap();

        assert_eq!(config.server.bind, "127.0.0.1:8640");
        assert_eq!(config.cache.max_size_mb, 1024);
        assert_eq!(config.cache.ttl_seconds, 86_400);
        assert!(config.models.is_empty());
        assert_eq!(config.effective_file_types().len(), FileTypeConfig::defaults().len());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "sync": { "auto_sync": true, "delete_local_after_sync": true },
                "models": [ { "entity_type": "invoice", "remote_folder_name": "Invoices" } ],
                "file_types": [ { "extension": ".PDF", "max_size_mb": 5 } ],
                "access": { "alice": ["invoice"] }
            }"#,
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();

        assert!(config.sync.auto_sync);
        assert!(config.sync.delete_local_after_sync);
        assert!(config.sync.is_active);
        assert_eq!(config.entity_types(), vec!["invoice".to_string()]);
        assert_eq!(config.effective_file_types().len(), 1);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.access["alice"], vec!["invoice".to_string()]);
    }

    #[test]
    fn test_save_and_reload_example() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.json");

        AppConfig::example().save(&path).unwrap();
        let config = AppConfig::load(&path).unwrap();

        assert_eq!(config.models, AppConfig::example().models);
        assert_eq!(config.paths, AppConfig::example().paths);
    }

    #[test]
    fn test_redirect_uri() {
        let mut server = ServerConfig::default();
        assert_eq!(server.redirect_uri(), "http://127.0.0.1:8640/oauth/callback");

        server.public_url = Some("https://files.example.com/".to_string());
        assert_eq!(server.redirect_uri(), "https://files.example.com/oauth/callback");
    }

    #[test]
    fn test_retry_config_to_backoff() {
        let backoff = RetryConfig::default().to_backoff();
        assert_eq!(backoff.max_attempts, 5);
        assert_eq!(backoff.base_delay, Duration::from_millis(500));
        assert_eq!(backoff.call_timeout, Duration::from_secs(60));
    }
}
