//! Key-value blob storage, the only persistence contract the core relies on.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;

/// Abstract blob store used for task records and the last-run marker.
///
/// `load` returns `Ok(None)` for an absent key; absence is never an error.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &str;

    /// Read the blob stored under `key`.
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the blob stored under `key`.
    async fn save(&self, key: &str, blob: &[u8]) -> Result<()>;
}

#[async_trait]
impl<T: Storage + ?Sized> Storage for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).load(key).await
    }

    async fn save(&self, key: &str, blob: &[u8]) -> Result<()> {
        (**self).save(key, blob).await
    }
}
