//! Miner configuration
//!
//! Loaded from TOML; every field has a default so a partial file is valid.
//!
//! ```toml
//! base_dir = "data"
//! slots = 8
//! block_lengths = [10, 100, 1000, 10000]
//! cache_capacity_bytes = 20000
//! resume = true
//!
//! [retry_policy]
//! mode = "redispatch"
//! max_attempts = 3
//! ```

use crate::digits::NATIVE_CHUNK_CHARS;
use crate::error::{Error, Result};
use crate::scheduler::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Miner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    /// Directory holding the store log
    pub base_dir: PathBuf,
    /// Number of concurrent worker slots
    pub slots: usize,
    /// Block lengths to hash at every offset (bytes)
    pub block_lengths: Vec<usize>,
    /// First offset to assign
    pub start_offset: u64,
    /// Stop assigning offsets at or past this one
    pub end_offset: Option<u64>,
    /// Per-slot digit cache capacity (bytes)
    pub cache_capacity_bytes: usize,
    pub retry_policy: RetryPolicy,
    /// Start from the stored resume cursor instead of `start_offset`
    pub resume: bool,
    /// Checkpoint the store after this many completed offsets (0 = only at shutdown)
    pub checkpoint_interval: u64,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("data"),
            slots: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            block_lengths: vec![10, 100, 1000, 10000],
            start_offset: 0,
            end_offset: None,
            cache_capacity_bytes: 20_000,
            retry_policy: RetryPolicy::default(),
            resume: false,
            checkpoint_interval: 100,
        }
    }
}

impl MinerConfig {
    /// Load from a TOML file. The result is not validated.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Longest configured block length
    pub fn max_block_length(&self) -> usize {
        self.block_lengths.iter().copied().max().unwrap_or(0)
    }

    /// Check the rules the scheduler relies on
    pub fn validate(&self) -> Result<()> {
        if self.block_lengths.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one block length is required".to_string(),
            ));
        }
        if let Some(&short) = self
            .block_lengths
            .iter()
            .find(|&&len| (len as u64) < NATIVE_CHUNK_CHARS)
        {
            return Err(Error::InvalidArgument(format!(
                "block length {} is below the native chunk size {}",
                short, NATIVE_CHUNK_CHARS
            )));
        }
        if self.slots == 0 {
            return Err(Error::InvalidArgument(
                "at least one worker slot is required".to_string(),
            ));
        }
        if self.cache_capacity_bytes < self.max_block_length() {
            return Err(Error::InvalidArgument(format!(
                "cache capacity {} is smaller than the largest block length {}",
                self.cache_capacity_bytes,
                self.max_block_length()
            )));
        }
        if let Some(end) = self.end_offset {
            if end < self.start_offset {
                return Err(Error::InvalidArgument(format!(
                    "end offset {} precedes start offset {}",
                    end, self.start_offset
                )));
            }
        }
        if let RetryPolicy::Redispatch { max_attempts: 0 } = self.retry_policy {
            return Err(Error::InvalidArgument(
                "redispatch needs at least one attempt".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() -> Result<()> {
        let config = MinerConfig::default();
        config.validate()?;
        assert_eq!(config.block_lengths, vec![10, 100, 1000, 10000]);
        assert_eq!(config.retry_policy, RetryPolicy::Backlog);
        Ok(())
    }

    #[test]
    fn test_partial_toml() -> Result<()> {
        let config = MinerConfig::from_toml_str(
            r#"
            slots = 2
            block_lengths = [10, 20]
            end_offset = 100

            [retry_policy]
            mode = "redispatch"
            max_attempts = 3
            "#,
        )?;

        assert_eq!(config.slots, 2);
        assert_eq!(config.block_lengths, vec![10, 20]);
        assert_eq!(config.end_offset, Some(100));
        assert_eq!(config.retry_policy, RetryPolicy::Redispatch { max_attempts: 3 });
        assert_eq!(config.cache_capacity_bytes, 20_000);
        config.validate()?;
        Ok(())
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let result = MinerConfig::from_toml_str("slots = \"many\"");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_validation_rules() {
        let base = MinerConfig::default();

        let mut config = base.clone();
        config.block_lengths.clear();
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));

        let mut config = base.clone();
        config.block_lengths = vec![10, 8];
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));

        let mut config = base.clone();
        config.slots = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));

        let mut config = base.clone();
        config.cache_capacity_bytes = 9_999;
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));

        let mut config = base.clone();
        config.start_offset = 100;
        config.end_offset = Some(50);
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));

        let mut config = base;
        config.retry_policy = RetryPolicy::Redispatch { max_attempts: 0 };
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));
    }
}
