//! Sliding window cache over generated π digits

use super::bbp::{self, NATIVE_CHUNK_CHARS};
use crate::error::{Error, Result};
use crate::metrics;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Bounded window over packed π digits, indexed by character offset
///
/// Byte `i` of the window holds the characters `[low + 2i, low + 2i + 2)`.
/// The window grows on demand in either direction and is pruned from the low
/// end only, so callers are expected to walk offsets upwards.
pub struct DigitCache {
    window: Mutex<Window>,
    max_byte_capacity: usize,
}

struct Window {
    low: u64,
    high: u64,
    bytes: VecDeque<u8>,
    max_bytes: usize,
    cancel: Option<CancellationToken>,
    hits: u64,
    misses: u64,
    generated_bytes: u64,
    evicted_bytes: u64,
}

impl DigitCache {
    /// Create a cache whose window starts with one native chunk at
    /// `starting_offset`
    pub fn new(starting_offset: u64, max_byte_capacity: usize) -> Result<Self> {
        let cache = Self::empty(starting_offset, max_byte_capacity)?;
        cache.ensure(starting_offset, starting_offset + NATIVE_CHUNK_CHARS)?;
        Ok(cache)
    }

    /// Create a cache with an empty window at `starting_offset`; nothing is
    /// generated until the first read
    pub fn empty(starting_offset: u64, max_byte_capacity: usize) -> Result<Self> {
        if max_byte_capacity < NATIVE_CHUNK_CHARS as usize {
            return Err(Error::InvalidArgument(format!(
                "cache capacity {} is below the native chunk size {}",
                max_byte_capacity, NATIVE_CHUNK_CHARS
            )));
        }

        Ok(Self {
            window: Mutex::new(Window {
                low: starting_offset,
                high: starting_offset,
                bytes: VecDeque::new(),
                max_bytes: max_byte_capacity,
                cancel: None,
                hits: 0,
                misses: 0,
                generated_bytes: 0,
                evicted_bytes: 0,
            }),
            max_byte_capacity,
        })
    }

    /// Abort generator calls made through this cache once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.window.get_mut().cancel = Some(token);
        self
    }

    /// Packed bytes covering characters `[minimum, maximum)`
    pub fn get_segment(&self, minimum: u64, maximum: u64) -> Result<Vec<u8>> {
        validate_range(minimum, maximum, self.max_byte_capacity)?;
        if minimum == maximum {
            return Ok(Vec::new());
        }

        let mut window = self.window.lock();
        window.ensure(minimum, maximum)?;
        window.segment(minimum, maximum)
    }

    /// Materialise `[minimum, maximum)` without copying it out
    pub fn ensure(&self, minimum: u64, maximum: u64) -> Result<()> {
        self.window.lock().ensure(minimum, maximum)
    }

    /// Current window bounds `(low, high)` in characters
    pub fn current_range(&self) -> (u64, u64) {
        let window = self.window.lock();
        (window.low, window.high)
    }

    pub fn max_byte_capacity(&self) -> usize {
        self.max_byte_capacity
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let window = self.window.lock();
        let total = window.hits + window.misses;
        let hit_rate = if total > 0 {
            window.hits as f64 / total as f64
        } else {
            0.0
        };

        CacheStats {
            hits: window.hits,
            misses: window.misses,
            hit_rate,
            generated_bytes: window.generated_bytes,
            evicted_bytes: window.evicted_bytes,
            window_bytes: window.bytes.len(),
            capacity: window.max_bytes,
        }
    }
}

impl std::fmt::Debug for DigitCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (low, high) = self.current_range();
        f.debug_struct("DigitCache")
            .field("low", &low)
            .field("high", &high)
            .field("max_byte_capacity", &self.max_byte_capacity)
            .finish()
    }
}

impl Window {
    /// Grow (and if needed prune) the window so it covers `[minimum, maximum)`.
    /// Callers hold the cache lock.
    fn ensure(&mut self, minimum: u64, maximum: u64) -> Result<()> {
        validate_range(minimum, maximum, self.max_bytes)?;
        if minimum == maximum {
            return Ok(());
        }
        if self.contains(minimum, maximum) {
            self.hits += 1;
            return Ok(());
        }
        self.misses += 1;

        // The byte grid is anchored at `low`; a request on the other parity
        // cannot share bytes with it.
        if (minimum ^ self.low) & 1 == 1 {
            debug!(low = self.low, minimum, "Realigning digit window");
            self.reset(minimum);
        }

        self.collect_garbage(minimum, maximum);

        if self.bytes.is_empty() {
            self.low = minimum;
            self.high = minimum;
        }

        if minimum < self.low {
            let count = ((self.low - minimum) / 2) as usize;
            let left = self.generate(minimum, count)?;
            for byte in left.into_iter().rev() {
                self.bytes.push_front(byte);
            }
            self.low = minimum;
        }

        if maximum > self.high {
            let count = ((maximum - self.high) / 2) as usize;
            let right = self.generate(self.high, count)?;
            self.bytes.extend(right);
            self.high = maximum;
        }

        trace!(low = self.low, high = self.high, bytes = self.bytes.len(), "Window extended");
        self.check_invariants()
    }

    fn contains(&self, minimum: u64, maximum: u64) -> bool {
        minimum >= self.low && maximum <= self.high && (minimum - self.low) % 2 == 0
    }

    /// Evict before growing when the prospective window would exceed capacity
    fn collect_garbage(&mut self, minimum: u64, maximum: u64) {
        let low = self.low.min(minimum);
        let high = self.high.max(maximum);
        if (high - low) / 2 <= self.max_bytes as u64 {
            return;
        }

        if minimum >= self.low && minimum <= self.high {
            self.prune_left(minimum);
        } else {
            self.reset(minimum);
        }
    }

    fn prune_left(&mut self, new_minimum: u64) {
        let evict = ((new_minimum - self.low) / 2) as usize;
        self.bytes.drain(..evict);
        self.low = new_minimum;
        self.record_eviction(evict);
        debug!(low = self.low, high = self.high, evicted = evict, "Pruned digit window");
    }

    fn reset(&mut self, at: u64) {
        let evict = self.bytes.len();
        self.bytes.clear();
        self.low = at;
        self.high = at;
        self.record_eviction(evict);
    }

    fn record_eviction(&mut self, bytes: usize) {
        self.evicted_bytes += bytes as u64;
        metrics::CACHE_BYTES_EVICTED.inc_by(bytes as u64);
    }

    fn generate(&mut self, offset: u64, count: usize) -> Result<Vec<u8>> {
        let bytes = match &self.cancel {
            Some(token) => bbp::generate_with(offset, count, token)?,
            None => bbp::generate(offset, count)?,
        };
        self.generated_bytes += count as u64;
        metrics::DIGIT_BYTES_GENERATED.inc_by(count as u64);
        Ok(bytes)
    }

    fn segment(&self, minimum: u64, maximum: u64) -> Result<Vec<u8>> {
        let start = ((minimum - self.low) / 2) as usize;
        let len = ((maximum - minimum) / 2) as usize;
        if !self.contains(minimum, maximum) || start + len > self.bytes.len() {
            return Err(Error::ConsistencyFault(format!(
                "segment [{}, {}) not inside window [{}, {})",
                minimum, maximum, self.low, self.high
            )));
        }
        Ok(self.bytes.range(start..start + len).copied().collect())
    }

    fn check_invariants(&self) -> Result<()> {
        if (self.high - self.low) != self.bytes.len() as u64 * 2 {
            return Err(Error::ConsistencyFault(format!(
                "window [{}, {}) holds {} bytes",
                self.low,
                self.high,
                self.bytes.len()
            )));
        }
        if self.bytes.len() > self.max_bytes {
            return Err(Error::ConsistencyFault(format!(
                "window holds {} bytes, capacity is {}",
                self.bytes.len(),
                self.max_bytes
            )));
        }
        Ok(())
    }
}

fn validate_range(minimum: u64, maximum: u64, max_bytes: usize) -> Result<()> {
    if maximum < minimum {
        return Err(Error::InvalidArgument(format!(
            "maximum {} is below minimum {}",
            maximum, minimum
        )));
    }
    let span = maximum - minimum;
    if span % 2 != 0 {
        return Err(Error::InvalidArgument(
            "spread must be a multiple of 2 characters".to_string(),
        ));
    }
    if span / 2 > max_bytes as u64 {
        return Err(Error::InvalidArgument(format!(
            "span of {} characters exceeds cache capacity of {} bytes",
            span, max_bytes
        )));
    }
    Ok(())
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub generated_bytes: u64,
    pub evicted_bytes: u64,
    pub window_bytes: usize,
    pub capacity: usize,
}
