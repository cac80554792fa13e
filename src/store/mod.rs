//! Persistence
//!
//! - [`DurableStore`]: string-keyed store with explicit checkpoints
//! - [`MemoryStore`]: concurrent in-memory map
//! - [`LogStore`]: append-only batch log on disk
//! - [`PiLedger`]: result key/value encodings on top of any store

pub mod engine;
pub mod ledger;
pub mod log;
pub mod memory;

pub use engine::DurableStore;
pub use ledger::{LedgerEntry, PiLedger};
pub use log::{LogBatch, LogStore};
pub use memory::MemoryStore;
