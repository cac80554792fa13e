//! Contiguous low watermark over completed offsets

use crate::digits::NATIVE_CHUNK_CHARS;
use std::collections::BTreeSet;

/// Lowest offset not yet completed
///
/// Offsets complete out of order; those above the watermark are parked until
/// the gap below them closes.
#[derive(Debug, Clone)]
pub struct Watermark {
    next: u64,
    parked: BTreeSet<u64>,
}

impl Watermark {
    pub fn new(start: u64) -> Self {
        Self {
            next: start,
            parked: BTreeSet::new(),
        }
    }

    pub fn value(&self) -> u64 {
        self.next
    }

    /// Completed offsets waiting on a lower one
    pub fn parked(&self) -> usize {
        self.parked.len()
    }

    /// Mark `offset` complete; returns whether the watermark moved
    pub fn complete(&mut self, offset: u64) -> bool {
        self.settle(offset)
    }

    /// Let the watermark pass a failed offset that will not be attempted
    /// again in this run. The offset stays reported by the retry backlog.
    pub fn skip(&mut self, offset: u64) -> bool {
        self.settle(offset)
    }

    fn settle(&mut self, offset: u64) -> bool {
        if offset < self.next {
            return false;
        }
        self.parked.insert(offset);

        let before = self.next;
        while self.parked.remove(&self.next) {
            match self.next.checked_add(NATIVE_CHUNK_CHARS) {
                Some(next) => self.next = next,
                None => break,
            }
        }
        self.next != before
    }
}
