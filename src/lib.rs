// BBP Miner - Rust Implementation
// Hash fingerprints of π digit blocks at arbitrary offsets

#![warn(rust_2018_idioms)]

pub mod config;
pub mod digits;
pub mod metrics;
pub mod scheduler;
pub mod store;
pub mod work;

// Re-exports for convenience
pub use config::MinerConfig;
pub use digits::{DigitCache, NATIVE_CHUNK_CHARS};
pub use scheduler::{MinerEvent, RetryPolicy, RunSummary, Tracker};
pub use store::{DurableStore, LogStore, MemoryStore, PiLedger};
pub use work::{BlockHash, WorkUnit};

/// BBP miner error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Work unit has not completed")]
        NotComplete,

        #[error("Generation failed at offset {offset}: {reason}")]
        GenerationFailure { offset: u64, reason: String },

        #[error("Digit generation cancelled")]
        Cancelled,

        #[error("Consistency fault: {0}")]
        ConsistencyFault(String),

        #[error("Storage error: {0}")]
        Storage(String),

        #[error("Configuration error: {0}")]
        Config(String),
    }

    impl Error {
        /// Whether this error is the cancellation outcome of a generator call
        pub fn is_cancelled(&self) -> bool {
            matches!(self, Error::Cancelled)
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_format() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_cancelled_detection() {
        let wrapped = error::Error::GenerationFailure {
            offset: 40,
            reason: error::Error::Cancelled.to_string(),
        };
        // Only the typed variant counts; message text is not inspected
        assert!(!wrapped.is_cancelled());
        assert!(error::Error::Cancelled.is_cancelled());
        assert!(!error::Error::NotComplete.is_cancelled());
    }
}
