//! Work unit: one offset, many block hashes

use crate::digits::{DigitCache, NATIVE_CHUNK_CHARS};
use crate::error::{Error, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// SHA-256 of a block of packed digit bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// Hash a block of packed digit bytes
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }

    /// Lower-case hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Results of a finished unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOutput {
    /// First hex digit of the segment (0..=15)
    pub first_digit: u8,
    /// Block length in bytes → hash of the first `length` bytes
    pub hashes: BTreeMap<usize, BlockHash>,
}

/// Completion state of a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitState {
    Pending,
    Ready(UnitOutput),
}

/// One block of work: a starting offset and the block lengths to hash there
#[derive(Debug, Clone)]
pub struct WorkUnit {
    start_offset: u64,
    block_lengths: Vec<usize>,
    state: UnitState,
}

impl WorkUnit {
    /// Create a pending unit.
    ///
    /// Block lengths are in bytes; duplicates are dropped and the set is
    /// sorted. Every length must be at least one native chunk.
    pub fn new(start_offset: u64, block_lengths: &[usize]) -> Result<Self> {
        if block_lengths.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one block length is required".to_string(),
            ));
        }
        if let Some(&short) = block_lengths
            .iter()
            .find(|&&len| (len as u64) < NATIVE_CHUNK_CHARS)
        {
            return Err(Error::InvalidArgument(format!(
                "block length {} is below the native chunk size {}",
                short, NATIVE_CHUNK_CHARS
            )));
        }

        let mut lengths = block_lengths.to_vec();
        lengths.sort_unstable();
        lengths.dedup();

        Ok(Self {
            start_offset,
            block_lengths: lengths,
            state: UnitState::Pending,
        })
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn block_lengths(&self) -> &[usize] {
        &self.block_lengths
    }

    pub fn state(&self) -> &UnitState {
        &self.state
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, UnitState::Ready(_))
    }

    /// Read the segment for the longest block from `cache` and hash every
    /// block length. A unit that is already complete is returned unchanged.
    pub fn work(mut self, cache: &DigitCache) -> Result<Self> {
        if self.is_complete() {
            return Ok(self);
        }

        let longest = self
            .block_lengths
            .last()
            .copied()
            .ok_or_else(|| Error::ConsistencyFault("work unit has no block lengths".to_string()))?;
        let end = (longest as u64)
            .checked_mul(2)
            .and_then(|chars| self.start_offset.checked_add(chars))
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "block of {} bytes at offset {} overflows",
                    longest, self.start_offset
                ))
            })?;

        let segment = cache.get_segment(self.start_offset, end)?;
        if segment.len() != longest {
            return Err(Error::ConsistencyFault(format!(
                "segment at offset {} has {} bytes, expected {}",
                self.start_offset,
                segment.len(),
                longest
            )));
        }

        let first_digit = segment[0] >> 4;
        let hashes = self
            .block_lengths
            .par_iter()
            .map(|&len| (len, BlockHash::of(&segment[..len])))
            .collect::<BTreeMap<_, _>>();

        self.state = UnitState::Ready(UnitOutput {
            first_digit,
            hashes,
        });
        Ok(self)
    }

    fn output(&self) -> Result<&UnitOutput> {
        match &self.state {
            UnitState::Ready(output) => Ok(output),
            UnitState::Pending => Err(Error::NotComplete),
        }
    }

    /// First hex digit of the segment
    pub fn first_digit(&self) -> Result<u8> {
        Ok(self.output()?.first_digit)
    }

    /// Hash for one block length
    pub fn hash(&self, length: usize) -> Result<BlockHash> {
        self.output()?.hashes.get(&length).copied().ok_or_else(|| {
            Error::InvalidArgument(format!("block length {} was not requested", length))
        })
    }

    /// All hashes, keyed by block length
    pub fn hashes(&self) -> Result<&BTreeMap<usize, BlockHash>> {
        Ok(&self.output()?.hashes)
    }

    /// `(block_length, first_digit, hash)` for every block length
    pub fn results(&self) -> Result<Vec<(usize, u8, BlockHash)>> {
        let output = self.output()?;
        Ok(output
            .hashes
            .iter()
            .map(|(&len, &hash)| (len, output.first_digit, hash))
            .collect())
    }
}
