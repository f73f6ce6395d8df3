//! Configuration Management
//!
//! Sync settings loaded from YAML. Every field has a default, so an empty
//! or missing file is a valid configuration.

use crate::engine::{EngineConfig, RetryPolicy};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Sync configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root tables to sync (glob patterns)
    pub tables: Vec<String>,
    /// Tables to leave out, roots or children (glob patterns)
    pub skip_tables: Vec<String>,
    /// Maximum in-flight fetches per relation depth
    pub concurrency: usize,
    pub channel_buffer: usize,
    pub sink_buffer: usize,
    /// Abort the sync after this many seconds
    pub timeout_secs: Option<u64>,
    pub retry: RetryConfig,
    pub gcp: GcpConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            tables: vec!["*".to_string()],
            skip_tables: Vec::new(),
            concurrency: engine.concurrency,
            channel_buffer: engine.channel_buffer,
            sink_buffer: engine.sink_buffer,
            timeout_secs: None,
            retry: RetryConfig::default(),
            gcp: GcpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
            multiplier: policy.multiplier,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
        }
    }
}

/// GCP source settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcpConfig {
    pub projects: Vec<String>,
    /// Environment variable holding an OAuth access token
    pub access_token_env: String,
    /// Endpoint overrides, keyed by service (`compute`, `storage`, `iam`)
    pub endpoints: std::collections::BTreeMap<String, String>,
}

impl Default for GcpConfig {
    fn default() -> Self {
        Self {
            projects: Vec::new(),
            access_token_env: "GOOGLE_OAUTH_ACCESS_TOKEN".to_string(),
            endpoints: Default::default(),
        }
    }
}

impl GcpConfig {
    pub fn access_token(&self) -> Option<String> {
        std::env::var(&self.access_token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
    }
}

impl SyncConfig {
    /// Default config file path
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("tablesync").join("config.yaml"))
    }

    /// Load configuration. An explicit path must exist; the default path is
    /// optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            concurrency: self.concurrency.max(1),
            channel_buffer: self.channel_buffer.max(1),
            sink_buffer: self.sink_buffer.max(1),
            timeout: self.timeout_secs.map(Duration::from_secs),
            retry: RetryPolicy::from(&self.retry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = SyncConfig::from_yaml("").unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.tables, vec!["*"]);
        assert_eq!(config.engine_config().retry.max_attempts, 1);
    }

    #[test]
    fn test_partial_yaml_overrides() {
        let yaml = r#"
tables: ["gcp_compute_*"]
skip_tables: ["gcp_compute_disks"]
concurrency: 2
timeout_secs: 60
retry:
  max_attempts: 3
gcp:
  projects: [alpha-project, beta-project]
  endpoints:
    compute: http://localhost:8080
"#;
        let config = SyncConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.tables, vec!["gcp_compute_*"]);
        assert_eq!(config.gcp.projects.len(), 2);
        assert_eq!(config.gcp.endpoints["compute"], "http://localhost:8080");
        assert_eq!(config.gcp.access_token_env, "GOOGLE_OAUTH_ACCESS_TOKEN");

        let engine = config.engine_config();
        assert_eq!(engine.concurrency, 2);
        assert_eq!(engine.timeout, Some(Duration::from_secs(60)));
        assert_eq!(engine.retry.max_attempts, 3);
        assert_eq!(engine.retry.initial_backoff, Duration::from_millis(500));
    }

    #[test]
    fn test_zero_values_are_clamped() {
        let config = SyncConfig::from_yaml("concurrency: 0\nchannel_buffer: 0").unwrap();
        let engine = config.engine_config();
        assert_eq!(engine.concurrency, 1);
        assert_eq!(engine.channel_buffer, 1);
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        assert!(SyncConfig::from_yaml("concurrency: [not a number]").is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let err = SyncConfig::load(Some(Path::new("/nonexistent/tablesync.yaml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
