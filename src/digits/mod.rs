//! π hex digit extraction
//!
//! # Architecture
//!
//! ```text
//! DigitCache (one per worker slot)
//!   └─→ Window [low, high)  ← VecDeque<u8>, two digits per byte
//!        ├─→ prepend  ← bbp::generate(minimum, ..)
//!        ├─→ append   ← bbp::generate(high, ..)
//!        └─→ prune_left (garbage collection, low end only)
//! ```
//!
//! The generator is stateless and can start at any offset, so the cache only
//! ever has to materialise the digits a worker is about to hash.

pub mod bbp;
pub mod cache;

pub use bbp::{generate, generate_with, hex_digits, MAX_OFFSET, NATIVE_CHUNK_CHARS};
pub use cache::{CacheStats, DigitCache};
