//! Durable store trait

use crate::error::Result;
use async_trait::async_trait;

/// String-keyed durable store
///
/// Implementations must tolerate concurrent upserts from several worker
/// slots. Upserts become durable at the next [`checkpoint`](Self::checkpoint).
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<String>>;
    async fn upsert(&self, key: &str, value: &str) -> Result<()>;

    /// Durably persist every pending upsert
    async fn checkpoint(&self) -> Result<()>;
}
