//! Append-only batch log store
//!
//! No WAL: upserts are buffered in memory and each checkpoint appends them as
//! one checksummed batch.
//!
//! # Layout
//!
//! ```text
//! {base_dir}/PiMiner/store.log
//! [Batch 1: {n0:b10→…, b10:s…→0}]        ← checkpoint
//! [Batch 2: {n10:b10→…, nextBlock:10→20}] ← checkpoint
//! ```
//!
//! Recovery: read all batches sequentially, last write wins. A torn or corrupt
//! batch ends the replay and the file is truncated back to the last intact one.

use crate::error::{Error, Result};
use crate::store::engine::DurableStore;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A batch of upserts written by one checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogBatch {
    /// Batch sequence number (monotonically increasing)
    pub sequence: u64,
    /// Timestamp (milliseconds since epoch)
    pub timestamp: i64,
    /// Key-value pairs in upsert order
    pub entries: Vec<(String, String)>,
}

impl LogBatch {
    pub fn new(sequence: u64, entries: Vec<(String, String)>) -> Self {
        Self {
            sequence,
            timestamp: chrono::Utc::now().timestamp_millis(),
            entries,
        }
    }

    /// Serialize to bytes with length prefix
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)
            .map_err(|e| Error::Storage(format!("Failed to serialize batch: {}", e)))?;

        // Format: [4-byte length][json data][4-byte checksum]
        let mut result = Vec::with_capacity(json.len() + 8);
        result.extend_from_slice(&(json.len() as u32).to_le_bytes());
        result.extend_from_slice(&json);
        result.extend_from_slice(&checksum(&json).to_le_bytes());

        Ok(result)
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(Error::Storage("Batch too short".to_string()));
        }

        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if bytes.len() < len + 8 {
            return Err(Error::Storage(format!(
                "Incomplete batch: expected {} bytes, got {}",
                len + 8,
                bytes.len()
            )));
        }

        let json = &bytes[4..4 + len];
        let stored = u32::from_le_bytes([
            bytes[4 + len],
            bytes[5 + len],
            bytes[6 + len],
            bytes[7 + len],
        ]);
        if stored != checksum(json) {
            return Err(Error::Storage("Checksum mismatch".to_string()));
        }

        serde_json::from_slice(json)
            .map_err(|e| Error::Storage(format!("Failed to deserialize batch: {}", e)))
    }
}

/// Rotating XOR over 4-byte lanes
fn checksum(data: &[u8]) -> u32 {
    data.iter()
        .enumerate()
        .fold(0u32, |acc, (i, &b)| acc ^ ((b as u32) << ((i % 4) * 8)))
}

/// Durable store persisted as a log of checkpoint batches
pub struct LogStore {
    log_path: PathBuf,
    /// Latest value per key, including un-checkpointed upserts
    index: RwLock<HashMap<String, String>>,
    /// Upserts since the last checkpoint
    pending: Mutex<Vec<(String, String)>>,
    /// Next sequence number; held while a batch is written
    next_sequence: Mutex<u64>,
}

impl LogStore {
    /// Subdirectory of the base directory holding the log
    pub const DIRECTORY: &'static str = "PiMiner";

    /// Create or open the store under `base_dir`
    pub fn open<P: AsRef<Path>>(base_dir: P) -> Result<Self> {
        let dir = base_dir.as_ref().join(Self::DIRECTORY);
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::Storage(format!("Failed to create store dir: {}", e)))?;

        let mut store = Self {
            log_path: dir.join("store.log"),
            index: RwLock::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            next_sequence: Mutex::new(0),
        };

        store.recover()?;

        Ok(store)
    }

    fn recover(&mut self) -> Result<()> {
        if !self.log_path.exists() {
            info!(path = ?self.log_path, "No store log found, starting fresh");
            return Ok(());
        }

        info!(path = ?self.log_path, "Recovering store from log");

        let file = File::open(&self.log_path)
            .map_err(|e| Error::Storage(format!("Failed to open log: {}", e)))?;
        let file_len = file
            .metadata()
            .map_err(|e| Error::Storage(format!("Failed to stat log: {}", e)))?
            .len();
        let mut reader = BufReader::new(file);

        let mut index = HashMap::new();
        let mut max_sequence = None;
        let mut batches = 0usize;
        // End of the last intact batch
        let mut valid_len = 0u64;

        loop {
            let mut len_bytes = [0u8; 4];
            match reader.read_exact(&mut len_bytes) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    warn!("Error reading batch length: {}", e);
                    break;
                }
            }

            let len = u32::from_le_bytes(len_bytes) as u64;
            if valid_len + len + 8 > file_len {
                warn!(batches, "Batch at offset {} runs past end of log", valid_len);
                break;
            }

            let mut batch_bytes = vec![0u8; len as usize + 8];
            batch_bytes[0..4].copy_from_slice(&len_bytes);
            if let Err(e) = reader.read_exact(&mut batch_bytes[4..]) {
                warn!(batches, "Dropping torn batch at log tail: {}", e);
                break;
            }

            match LogBatch::from_bytes(&batch_bytes) {
                Ok(batch) => {
                    for (key, value) in batch.entries {
                        index.insert(key, value);
                    }
                    max_sequence = max_sequence.max(Some(batch.sequence));
                    batches += 1;
                    valid_len += len + 8;
                }
                Err(e) => {
                    warn!("Failed to deserialize batch: {}", e);
                    break;
                }
            }
        }

        drop(reader);

        // New batches must follow the last intact one, not the damaged bytes
        if valid_len < file_len {
            warn!(
                valid_len,
                file_len,
                "Truncating {} damaged bytes from log tail",
                file_len - valid_len
            );
            let file = OpenOptions::new()
                .write(true)
                .open(&self.log_path)
                .map_err(|e| Error::Storage(format!("Failed to open log: {}", e)))?;
            file.set_len(valid_len)
                .map_err(|e| Error::Storage(format!("Failed to truncate log: {}", e)))?;
            file.sync_all()
                .map_err(|e| Error::Storage(format!("Failed to sync log: {}", e)))?;
        }

        let next_sequence = max_sequence.map_or(0, |s| s + 1);
        info!(batches, keys = index.len(), next_sequence, "Store recovery complete");

        *self.index.get_mut() = index;
        *self.next_sequence.get_mut() = next_sequence;
        Ok(())
    }

    /// Path of the log file
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Get number of keys
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Upserts not yet covered by a checkpoint
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    fn append_batch(&self, sequence: u64, entries: Vec<(String, String)>) -> Result<()> {
        let count = entries.len();
        let bytes = LogBatch::new(sequence, entries).to_bytes()?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|e| Error::Storage(format!("Failed to open log: {}", e)))?;
        file.write_all(&bytes)
            .map_err(|e| Error::Storage(format!("Failed to write batch: {}", e)))?;
        file.sync_all()
            .map_err(|e| Error::Storage(format!("Failed to sync log: {}", e)))?;

        debug!(sequence, entries = count, "Wrote store batch");
        Ok(())
    }

    /// Rewrite the log as a single batch holding the latest value per key.
    /// Pending upserts become durable as part of the rewrite.
    pub fn compact(&self) -> Result<()> {
        info!(path = ?self.log_path, "Compacting store log");

        let mut sequence = self.next_sequence.lock();
        // Held until the rewrite lands so no upsert slips between snapshot and clear
        let mut pending = self.pending.lock();
        let snapshot: Vec<(String, String)> = self
            .index
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let temp_path = self.log_path.with_extension("log.tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| Error::Storage(format!("Failed to create temp log: {}", e)))?;

        let bytes = LogBatch::new(0, snapshot).to_bytes()?;
        file.write_all(&bytes)
            .map_err(|e| Error::Storage(format!("Failed to write compacted log: {}", e)))?;
        file.sync_all()
            .map_err(|e| Error::Storage(format!("Failed to sync compacted log: {}", e)))?;

        std::fs::rename(&temp_path, &self.log_path)
            .map_err(|e| Error::Storage(format!("Failed to rename log: {}", e)))?;

        pending.clear();
        *sequence = 1;

        info!("Log compaction complete");
        Ok(())
    }
}

#[async_trait]
impl DurableStore for LogStore {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.index.read().get(key).cloned())
    }

    async fn upsert(&self, key: &str, value: &str) -> Result<()> {
        // Both under the pending lock: log order and index agree on the last
        // write, and a checkpoint never misses a value that is already readable
        let mut pending = self.pending.lock();
        pending.push((key.to_string(), value.to_string()));
        self.index.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn checkpoint(&self) -> Result<()> {
        let mut sequence = self.next_sequence.lock();
        let entries = std::mem::take(&mut *self.pending.lock());
        if entries.is_empty() {
            return Ok(());
        }

        match self.append_batch(*sequence, entries.clone()) {
            Ok(()) => {
                *sequence += 1;
                Ok(())
            }
            Err(e) => {
                // Keep the upserts for the next attempt, ahead of newer ones
                let mut pending = self.pending.lock();
                let newer = std::mem::replace(&mut *pending, entries);
                pending.extend(newer);
                Err(e)
            }
        }
    }
}
