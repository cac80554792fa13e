//! Worker slots

use crate::digits::DigitCache;
use crate::error::{Error, Result};
use crate::metrics;
use std::fmt;
use std::sync::Arc;

/// Index of a worker slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Running { offset: u64, attempt: u32 },
}

/// A worker slot and the digit cache it reads through
#[derive(Debug)]
pub struct Slot {
    pub id: SlotId,
    state: SlotState,
    cache: Arc<DigitCache>,
    completed: u64,
    failed: u64,
}

impl Slot {
    pub fn new(id: SlotId, cache: DigitCache) -> Self {
        Self {
            id,
            state: SlotState::Idle,
            cache: Arc::new(cache),
            completed: 0,
            failed: 0,
        }
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == SlotState::Idle
    }

    /// Shared handle for the blocking task
    pub fn cache(&self) -> Arc<DigitCache> {
        Arc::clone(&self.cache)
    }

    /// Idle → Running
    pub fn assign(&mut self, offset: u64, attempt: u32) -> Result<()> {
        if let SlotState::Running { offset: current, .. } = self.state {
            return Err(Error::ConsistencyFault(format!(
                "{} is still running offset {}",
                self.id, current
            )));
        }
        self.state = SlotState::Running { offset, attempt };
        metrics::BUSY_SLOTS.inc();
        Ok(())
    }

    /// Running → Idle; returns the offset that was running
    pub fn release(&mut self, success: bool) -> Option<u64> {
        match std::mem::replace(&mut self.state, SlotState::Idle) {
            SlotState::Running { offset, .. } => {
                metrics::BUSY_SLOTS.dec();
                if success {
                    self.completed += 1;
                } else {
                    self.failed += 1;
                }
                Some(offset)
            }
            SlotState::Idle => None,
        }
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }
}
