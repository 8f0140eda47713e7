//! Key-value blob stores and the task repository helpers built on them.
//!
//! Tasks live as one JSON array under [`TASKS_KEY`]; the recovery marker
//! lives under [`LAST_RUN_KEY`]. The file store keeps one human-readable
//! JSON file per key.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use chime_core::config::StorageConfig;
use chime_core::error::{ChimeError, Result};
use chime_core::traits::Storage;

use crate::sqlite::SqliteStore;
use crate::tasks::Task;

pub const TASKS_KEY: &str = "tasks";
pub const LAST_RUN_KEY: &str = "scheduler.last_run";

/// "The scheduler completed a recovery pass at this time."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastRunMarker {
    pub timestamp: DateTime<Utc>,
}

/// In-process store. Contents are lost on drop.
#[derive(Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, blob: &[u8]) -> Result<()> {
        self.blobs.write().await.insert(key.to_string(), blob.to_vec());
        Ok(())
    }
}

/// File-based store: `<dir>/<key>.json`, replaced atomically on save.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `dir`. The directory is created lazily on
    /// the first save.
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// Default store path (~/.chime/store).
    pub fn default_path() -> PathBuf {
        chime_core::ChimeConfig::home_dir().join("store")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl Storage for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.file_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ChimeError::Storage(format!("Read {key}: {e}"))),
        }
    }

    async fn save(&self, key: &str, blob: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let file = self.file_for(key);
        let tmp = file.with_extension("json.tmp");
        tokio::fs::write(&tmp, blob)
            .await
            .map_err(|e| ChimeError::Storage(format!("Write {key}: {e}")))?;
        tokio::fs::rename(&tmp, &file)
            .await
            .map_err(|e| ChimeError::Storage(format!("Rename {key}: {e}")))?;
        tracing::debug!("💾 Saved {} ({} bytes)", file.display(), blob.len());
        Ok(())
    }
}

/// Open the backend named in the config.
pub fn open(config: &StorageConfig) -> Result<Arc<dyn Storage>> {
    let path = config.resolved_path();
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        "file" => Ok(Arc::new(FileStore::new(&path))),
        "sqlite" => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Ok(Arc::new(SqliteStore::open(&path)?))
        }
        other => Err(ChimeError::Config(format!("Unknown storage backend: {other}"))),
    }
}

// ─── Task repository ──────────────────────────────────────

/// All stored tasks; an absent blob is an empty list.
pub async fn load_tasks(storage: &dyn Storage) -> Result<Vec<Task>> {
    match storage.load(TASKS_KEY).await? {
        Some(blob) => Ok(serde_json::from_slice(&blob)?),
        None => Ok(Vec::new()),
    }
}

pub async fn save_tasks(storage: &dyn Storage, tasks: &[Task]) -> Result<()> {
    let blob = serde_json::to_vec_pretty(tasks)?;
    storage.save(TASKS_KEY, &blob).await
}

/// Insert or replace one task by ID.
pub async fn save_task(storage: &dyn Storage, task: &Task) -> Result<()> {
    let mut tasks = load_tasks(storage).await?;
    match tasks.iter_mut().find(|t| t.id == task.id) {
        Some(existing) => *existing = task.clone(),
        None => tasks.push(task.clone()),
    }
    save_tasks(storage, &tasks).await
}

pub async fn load_last_run(storage: &dyn Storage) -> Result<Option<LastRunMarker>> {
    match storage.load(LAST_RUN_KEY).await? {
        Some(blob) => Ok(Some(serde_json::from_slice(&blob)?)),
        None => Ok(None),
    }
}

pub async fn save_last_run(storage: &dyn Storage, marker: &LastRunMarker) -> Result<()> {
    let blob = serde_json::to_vec(marker)?;
    storage.save(LAST_RUN_KEY, &blob).await
}
