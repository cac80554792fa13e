//! Offset cursor shared by the scheduler

use crate::digits::NATIVE_CHUNK_CHARS;
use parking_lot::Mutex;

#[derive(Debug)]
struct Cursor {
    next: u64,
    end: Option<u64>,
    exhausted: bool,
}

/// Hands out offsets in strictly increasing order, one native chunk apart
#[derive(Debug)]
pub struct OffsetAllocator {
    cursor: Mutex<Cursor>,
}

impl OffsetAllocator {
    /// Offsets start at `start`; `end`, when set, is exclusive
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self {
            cursor: Mutex::new(Cursor {
                next: start,
                end,
                exhausted: end.is_some_and(|end| start >= end),
            }),
        }
    }

    /// Take the next offset, or `None` once the end is reached
    pub fn next(&self) -> Option<u64> {
        let mut cursor = self.cursor.lock();
        if cursor.exhausted {
            return None;
        }

        let offset = cursor.next;
        match offset.checked_add(NATIVE_CHUNK_CHARS) {
            Some(next) => {
                cursor.next = next;
                if cursor.end.is_some_and(|end| next >= end) {
                    cursor.exhausted = true;
                }
            }
            None => cursor.exhausted = true,
        }
        Some(offset)
    }

    /// Offset the next call to [`next`](Self::next) would return
    pub fn peek(&self) -> u64 {
        self.cursor.lock().next
    }

    pub fn end(&self) -> Option<u64> {
        self.cursor.lock().end
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor.lock().exhausted
    }
}
