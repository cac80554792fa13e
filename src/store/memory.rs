//! In-memory store
//!
//! Used by tests and dry runs; checkpoints are counted but persist nothing.

use crate::error::Result;
use crate::store::engine::DurableStore;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// In-memory store backed by a concurrent map
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<DashMap<String, String>>,
    checkpoints: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of keys stored
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of checkpoints taken so far
    pub fn checkpoint_count(&self) -> u64 {
        self.checkpoints.load(Ordering::Relaxed)
    }

    /// Keys starting with `prefix`
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.data
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.data.get(key).map(|value| value.clone()))
    }

    async fn upsert(&self, key: &str, value: &str) -> Result<()> {
        self.data.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn checkpoint(&self) -> Result<()> {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_basic_ops() -> Result<()> {
        let store = MemoryStore::new();

        store.upsert("n0:b10", "2:abc").await?;
        assert_eq!(store.read("n0:b10").await?, Some("2:abc".to_string()));
        assert_eq!(store.read("n10:b10").await?, None);

        store.upsert("n0:b10", "2:def").await?;
        assert_eq!(store.read("n0:b10").await?, Some("2:def".to_string()));
        assert_eq!(store.len(), 1);

        store.checkpoint().await?;
        assert_eq!(store.checkpoint_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_clones_share_data() -> Result<()> {
        let store = MemoryStore::new();
        let other = store.clone();
        other.upsert("nextBlock:10", "40").await?;
        assert_eq!(store.read("nextBlock:10").await?, Some("40".to_string()));
        assert_eq!(store.keys_with_prefix("nextBlock:"), vec!["nextBlock:10".to_string()]);
        Ok(())
    }
}
