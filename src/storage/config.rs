//! Configuration handling
//!
//! Project configuration is stored in `.braid/config.yaml`. A missing file
//! means defaults everywhere; unknown keys are ignored so older binaries can
//! read newer configs.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::DependencyKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// Settings for git synchronization
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Commit the JSONL after each export
    pub auto_commit: bool,

    /// Push after a successful commit
    pub auto_push: bool,

    /// Remote used for pull/push
    pub remote: String,

    /// Dedicated branch for JSONL commits; unset commits on the working branch
    pub branch: Option<String>,

    /// Seconds between full sync cycles in the daemon
    pub interval_seconds: u64,

    /// Seconds of quiet before a file-system change triggers an import
    pub debounce_seconds: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_commit: true,
            auto_push: false,
            remote: "origin".to_string(),
            branch: None,
            interval_seconds: 300,
            debounce_seconds: 5,
        }
    }
}

/// Settings for the background daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Enable daemon functionality
    pub enabled: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Project configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Prefix for newly minted issue IDs
    pub issue_prefix: String,

    /// Dependency kinds that gate ready-work computations
    pub ready_kinds: Vec<DependencyKind>,

    /// Git sync settings
    pub sync: SyncConfig,

    /// Daemon settings
    pub daemon: DaemonConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            issue_prefix: "br".to_string(),
            ready_kinds: DependencyKind::default_ready_kinds(),
            sync: SyncConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from `.braid/config.yaml`, defaulting when absent
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config: {}", config_path.display()))?;

        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(e.to_string()))
            .with_context(|| format!("Failed to parse config: {}", config_path.display()))
    }

    /// Saves configuration to the given path
    pub fn save(&self, config_path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;
        fs::write(config_path, content)
            .with_context(|| format!("Failed to write config: {}", config_path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(&dir.path().join("config.yaml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.issue_prefix, "br");
        assert!(config.sync.auto_commit);
        assert!(!config.sync.auto_push);
    }

    #[test]
    fn parse_partial_config() {
        let yaml = r#"
issue_prefix: bd
sync:
  auto_push: true
  branch: braid-sync
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.issue_prefix, "bd");
        assert!(config.sync.auto_push);
        assert_eq!(config.sync.branch.as_deref(), Some("braid-sync"));
        // Unspecified fields keep their defaults
        assert!(config.sync.auto_commit);
        assert_eq!(config.sync.remote, "origin");
    }

    #[test]
    fn ready_kinds_configurable() {
        let yaml = r#"
ready_kinds:
  - blocks
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.ready_kinds, vec![DependencyKind::Blocks]);
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");

        let mut config = Config::default();
        config.sync.branch = Some("braid-sync".to_string());
        config.sync.interval_seconds = 60;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
