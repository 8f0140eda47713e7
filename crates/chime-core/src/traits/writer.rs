//! Snapshot writer injected into the persistence controller.

use async_trait::async_trait;

use crate::error::Result;

/// Durable sink for a complete state snapshot.
///
/// Implementations must tolerate being called repeatedly with an identical
/// `state`: failed writes are retried with the same value.
#[async_trait]
pub trait Writer<S: Send + Sync>: Send + Sync {
    async fn write(&self, state: &S) -> Result<()>;
}
