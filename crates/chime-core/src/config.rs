//! Chime configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ChimeError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChimeConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl ChimeConfig {
    /// Load config from the default path (~/.chime/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ChimeError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ChimeError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| ChimeError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Chime home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".chime")
    }

    /// Log the effective settings at startup.
    pub fn log_summary(&self) {
        tracing::info!(
            "⚙️ scheduler: poll={}ms recovery_cap={}",
            self.scheduler.poll_interval_ms,
            self.scheduler.recovery_cap
        );
        tracing::info!(
            "⚙️ persistence: debounce={}ms backoff={}..{}ms max_attempts={}",
            self.persistence.debounce_ms,
            self.persistence.initial_backoff_ms,
            self.persistence.max_backoff_ms,
            self.persistence.max_attempts
        );
        tracing::info!(
            "⚙️ storage: backend={} path={}",
            self.storage.backend,
            self.storage.resolved_path().display()
        );
    }
}

/// Poll loop and recovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Max missed occurrences enumerated per task during recovery.
    #[serde(default = "default_recovery_cap")]
    pub recovery_cap: usize,
}

fn default_poll_interval_ms() -> u64 { 60_000 }
fn default_recovery_cap() -> usize { 1_000 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            recovery_cap: default_recovery_cap(),
        }
    }
}

/// Debounce and retry settings for the persistence controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// 0 retries until the write succeeds or is superseded.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_debounce_ms() -> u64 { 500 }
fn default_initial_backoff_ms() -> u64 { 100 }
fn default_max_backoff_ms() -> u64 { 30_000 }
fn default_max_attempts() -> u32 { 10 }

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Where task state lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "file", "sqlite" or "memory".
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Directory (file backend) or database path (sqlite backend).
    #[serde(default)]
    pub path: Option<String>,
}

fn default_backend() -> String { "file".into() }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: None,
        }
    }
}

impl StorageConfig {
    /// Configured path, or the backend's default under ~/.chime.
    pub fn resolved_path(&self) -> PathBuf {
        match &self.path {
            Some(p) => PathBuf::from(p),
            None if self.backend == "sqlite" => ChimeConfig::home_dir().join("chime.db"),
            None => ChimeConfig::home_dir().join("store"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ChimeConfig::default();
        assert_eq!(config.scheduler.poll_interval_ms, 60_000);
        assert_eq!(config.scheduler.recovery_cap, 1_000);
        assert_eq!(config.persistence.debounce_ms, 500);
        assert_eq!(config.persistence.max_attempts, 10);
        assert_eq!(config.storage.backend, "file");
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [scheduler]
            poll_interval_ms = 5000

            [persistence]
            debounce_ms = 250
            max_attempts = 3

            [storage]
            backend = "sqlite"
            path = "/tmp/chime-test.db"
        "#;

        let config: ChimeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.scheduler.poll_interval_ms, 5000);
        assert_eq!(config.scheduler.recovery_cap, 1_000);
        assert_eq!(config.persistence.debounce_ms, 250);
        assert_eq!(config.persistence.max_attempts, 3);
        assert_eq!(config.persistence.initial_backoff_ms, 100);
        assert_eq!(
            config.storage.resolved_path(),
            PathBuf::from("/tmp/chime-test.db")
        );
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: ChimeConfig = toml::from_str("").unwrap();
        assert_eq!(config.scheduler.poll_interval_ms, 60_000);
        assert_eq!(config.persistence.max_backoff_ms, 30_000);
    }

    #[test]
    fn test_load_from_missing_file_is_config_error() {
        let err = ChimeConfig::load_from(Path::new("/nonexistent/chime.toml")).unwrap_err();
        assert!(matches!(err, ChimeError::Config(_)));
    }

    #[test]
    fn test_home_dir() {
        let home = ChimeConfig::home_dir();
        assert!(home.to_string_lossy().contains("chime"));
        assert!(StorageConfig::default().resolved_path().ends_with("store"));
    }
}
