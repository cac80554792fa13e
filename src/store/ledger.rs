//! Result ledger
//!
//! Encodes mined results into string keys on a [`DurableStore`]:
//!
//! ```text
//! n{offset}:b{length}       → {firstDigitHex}:{hashHex}
//! b{length}:s{hashHex}      → offset,offset,...
//! nextBlock:{length}        → offset
//! ```

use crate::error::{Error, Result};
use crate::metrics;
use crate::store::engine::DurableStore;
use crate::work::BlockHash;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Key for the result of one block at one offset
pub fn nsize_key(offset: u64, length: usize) -> String {
    format!("n{}:b{}", offset, length)
}

/// Value stored under [`nsize_key`]; the digit is upper-case, the hash lower-case
pub fn nsize_value(first_digit: u8, hash: &BlockHash) -> String {
    format!("{:X}:{}", first_digit & 0x0F, hash.to_hex())
}

/// Split a [`nsize_value`] back into digit and hash hex
pub fn parse_nsize_value(value: &str) -> Result<(u8, String)> {
    let (digit, hash) = value
        .split_once(':')
        .ok_or_else(|| Error::Storage(format!("malformed block entry '{}'", value)))?;
    if digit.len() != 1 {
        return Err(Error::Storage(format!("malformed first digit '{}'", digit)));
    }
    let digit = u8::from_str_radix(digit, 16)
        .map_err(|e| Error::Storage(format!("malformed first digit '{}': {}", digit, e)))?;
    Ok((digit, hash.to_string()))
}

/// Key listing every offset whose block of `length` bytes hashes to `hash`
pub fn size_hash_key(length: usize, hash: &BlockHash) -> String {
    format!("b{}:s{}", length, hash.to_hex())
}

/// Key holding the resume cursor for one block length
pub fn next_offset_key(length: usize) -> String {
    format!("nextBlock:{}", length)
}

/// Decode a comma-joined offset list
pub fn parse_offsets(value: &str) -> Result<Vec<u64>> {
    if value.is_empty() {
        return Ok(Vec::new());
    }
    value
        .split(',')
        .map(|part| {
            part.parse::<u64>()
                .map_err(|e| Error::Storage(format!("malformed offset '{}': {}", part, e)))
        })
        .collect()
}

/// Append `offset` to a comma-joined list unless it is already listed.
/// Returns `None` when the list is unchanged.
pub fn append_offset(existing: Option<&str>, offset: u64) -> Result<Option<String>> {
    match existing {
        None | Some("") => Ok(Some(offset.to_string())),
        Some(list) => {
            if parse_offsets(list)?.contains(&offset) {
                Ok(None)
            } else {
                Ok(Some(format!("{},{}", list, offset)))
            }
        }
    }
}

/// Stored result of one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub first_digit: u8,
    pub hash_hex: String,
}

/// Typed view over a [`DurableStore`]
pub struct PiLedger {
    store: Arc<dyn DurableStore>,
    /// Serialises the read-modify-write on the dedup lists
    dedup_lock: Mutex<()>,
}

impl PiLedger {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            dedup_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    /// Record one block result.
    ///
    /// Returns `true` when another offset already produced the same hash
    /// for this block length.
    pub async fn record(
        &self,
        offset: u64,
        length: usize,
        first_digit: u8,
        hash: &BlockHash,
    ) -> Result<bool> {
        self.store
            .upsert(&nsize_key(offset, length), &nsize_value(first_digit, hash))
            .await?;

        let key = size_hash_key(length, hash);
        let _guard = self.dedup_lock.lock().await;
        let existing = self.store.read(&key).await?;

        let collision = match existing.as_deref() {
            Some(list) if !list.is_empty() => parse_offsets(list)?.iter().any(|&o| o != offset),
            _ => false,
        };

        if let Some(updated) = append_offset(existing.as_deref(), offset)? {
            self.store.upsert(&key, &updated).await?;
        }

        if collision {
            metrics::DEDUP_COLLISIONS.inc();
            info!(offset, length, hash = %hash, "Duplicate block hash");
        } else {
            debug!(offset, length, "Recorded block");
        }

        Ok(collision)
    }

    /// Stored result for one block, if any
    pub async fn lookup(&self, offset: u64, length: usize) -> Result<Option<LedgerEntry>> {
        match self.store.read(&nsize_key(offset, length)).await? {
            Some(value) => {
                let (first_digit, hash_hex) = parse_nsize_value(&value)?;
                Ok(Some(LedgerEntry {
                    first_digit,
                    hash_hex,
                }))
            }
            None => Ok(None),
        }
    }

    /// Offsets whose block of `length` bytes hashed to `hash_hex`
    pub async fn offsets_for(&self, length: usize, hash_hex: &str) -> Result<Vec<u64>> {
        let key = format!("b{}:s{}", length, hash_hex.to_ascii_lowercase());
        match self.store.read(&key).await? {
            Some(list) => parse_offsets(&list),
            None => Ok(Vec::new()),
        }
    }

    /// Resume cursor for one block length, if one was ever written
    pub async fn stored_next_offset(&self, length: usize) -> Result<Option<u64>> {
        match self.store.read(&next_offset_key(length)).await? {
            Some(value) => value.parse::<u64>().map(Some).map_err(|e| {
                Error::Storage(format!("malformed cursor for length {}: {}", length, e))
            }),
            None => Ok(None),
        }
    }

    /// Resume cursor for one block length; 0 when never written
    pub async fn next_offset(&self, length: usize) -> Result<u64> {
        Ok(self.stored_next_offset(length).await?.unwrap_or(0))
    }

    pub async fn set_next_offset(&self, length: usize, offset: u64) -> Result<()> {
        self.store
            .upsert(&next_offset_key(length), &offset.to_string())
            .await
    }

    pub async fn checkpoint(&self) -> Result<()> {
        self.store.checkpoint().await
    }
}
