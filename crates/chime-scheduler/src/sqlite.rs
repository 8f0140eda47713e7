//! SQLite-backed blob store.
//! Survives restarts; every key is one row in the `kv` table.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};

use chime_core::error::{ChimeError, Result};
use chime_core::traits::Storage;

/// SQLite key-value store. Blocking calls run on tokio's blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| ChimeError::Storage(format!("DB open: {e}")))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ChimeError::Storage(format!("DB open: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                blob BLOB NOT NULL,
                updated_at TEXT NOT NULL
            );
         ",
            )
            .map_err(|e| ChimeError::Storage(format!("Migration: {e}")))
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            op(&guard)
        })
        .await
        .map_err(|e| ChimeError::Storage(format!("DB task: {e}")))?
        .map_err(|e| ChimeError::Storage(format!("DB: {e}")))
    }
}

#[async_trait]
impl Storage for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = key.to_string();
        self.blocking(move |conn| {
            conn.query_row("SELECT blob FROM kv WHERE key = ?1", [&key], |row| row.get(0))
                .optional()
        })
        .await
    }

    async fn save(&self, key: &str, blob: &[u8]) -> Result<()> {
        let key = key.to_string();
        let blob = blob.to_vec();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO kv (key, blob, updated_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![key, blob, Utc::now().to_rfc3339()],
            )
            .map(|_| ())
        })
        .await
    }
}
