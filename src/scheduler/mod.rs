//! Concurrent work scheduler
//!
//! The [`Tracker`] owns a fixed pool of worker slots. Each slot reads through
//! its own [`DigitCache`]; units run on tokio's blocking pool and are tracked
//! in a `JoinSet`.
//!
//! ```text
//!   OffsetAllocator ──► idle slot ──► spawn_blocking(unit.work(cache))
//!         ▲                                   │
//!   RetryBacklog ◄── failure ◄────────────────┤
//!                                             ▼
//!                              success ──► PiLedger ──► DurableStore
//! ```
//!
//! Per slot: `Idle → Running → {succeeded, failed} → Idle`. On cancellation no
//! new offsets are assigned; in-flight units see the token inside the
//! generator and land in the backlog as cancelled failures. The tracker then
//! drains, checkpoints and returns a [`RunSummary`].

pub mod allocator;
pub mod retry;
pub mod slot;
pub mod watermark;

pub use allocator::OffsetAllocator;
pub use retry::{FailedOffset, RetryBacklog, RetryPolicy};
pub use slot::{Slot, SlotId, SlotState};
pub use watermark::Watermark;

use crate::config::MinerConfig;
use crate::digits::DigitCache;
use crate::error::{Error, Result};
use crate::metrics;
use crate::store::PiLedger;
use crate::work::{BlockHash, WorkUnit};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Progress notifications for observers such as the CLI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MinerEvent {
    Dispatched {
        slot: SlotId,
        offset: u64,
        attempt: u32,
    },
    BlockHashed {
        offset: u64,
        length: usize,
        first_digit: u8,
        hash: BlockHash,
        duplicate: bool,
    },
    OffsetCompleted {
        slot: SlotId,
        offset: u64,
        first_digit: u8,
    },
    OffsetFailed {
        slot: SlotId,
        offset: u64,
        attempts: u32,
        reason: String,
        cancelled: bool,
    },
}

/// Outcome of [`Tracker::run`]
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Offsets whose every block was recorded
    pub completed: u64,
    /// Failed attempts, including cancelled ones
    pub failed: u64,
    /// Block hashes already seen at another offset
    pub duplicates: u64,
    /// Resume cursor written to the store
    pub next_offset: u64,
    /// Offsets still failed at exit
    pub backlog: Vec<FailedOffset>,
    pub cancelled: bool,
}

type UnitOutcome = (usize, u64, Result<WorkUnit>);

/// Drives work units across worker slots
pub struct Tracker {
    config: MinerConfig,
    ledger: Arc<PiLedger>,
    allocator: Arc<OffsetAllocator>,
    slots: Vec<Slot>,
    backlog: RetryBacklog,
    watermark: Watermark,
    cancel: CancellationToken,
    events: Option<UnboundedSender<MinerEvent>>,
    completed: u64,
    failed: u64,
    duplicates: u64,
    since_checkpoint: u64,
}

impl Tracker {
    /// Build a tracker whose offsets come from `allocator`
    pub fn new(
        config: MinerConfig,
        ledger: Arc<PiLedger>,
        allocator: Arc<OffsetAllocator>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;

        let start = allocator.peek();
        let slots = (0..config.slots)
            .map(|idx| -> Result<Slot> {
                let cache = DigitCache::empty(start, config.cache_capacity_bytes)?
                    .with_cancellation(cancel.clone());
                Ok(Slot::new(SlotId(idx), cache))
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            slots = slots.len(),
            start,
            end = ?allocator.end(),
            block_lengths = ?config.block_lengths,
            retry_policy = ?config.retry_policy,
            "Tracker created"
        );

        Ok(Self {
            config,
            ledger,
            allocator,
            slots,
            backlog: RetryBacklog::new(),
            watermark: Watermark::new(start),
            cancel,
            events: None,
            completed: 0,
            failed: 0,
            duplicates: 0,
            since_checkpoint: 0,
        })
    }

    /// Build a tracker from configuration alone, resuming from the stored
    /// cursor when `config.resume` is set
    pub async fn from_config(
        config: MinerConfig,
        ledger: Arc<PiLedger>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        let start = resume_offset(&config, &ledger).await?;
        let allocator = Arc::new(OffsetAllocator::new(start, config.end_offset));
        Self::new(config, ledger, allocator, cancel)
    }

    /// Send progress events to `sender`
    pub fn with_events(mut self, sender: UnboundedSender<MinerEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn allocator(&self) -> &Arc<OffsetAllocator> {
        &self.allocator
    }

    pub fn backlog(&self) -> &RetryBacklog {
        &self.backlog
    }

    pub fn watermark(&self) -> &Watermark {
        &self.watermark
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run until cancelled or, with an end offset, until every offset has
    /// been processed
    #[instrument(skip(self), fields(slots = self.slots.len()))]
    pub async fn run(&mut self) -> Result<RunSummary> {
        let cancel = self.cancel.clone();
        let mut tasks: JoinSet<UnitOutcome> = JoinSet::new();
        let mut task_slots: HashMap<tokio::task::Id, usize> = HashMap::new();

        loop {
            if !cancel.is_cancelled() {
                self.dispatch_idle(&mut tasks, &mut task_slots)?;
            }

            if tasks.is_empty() {
                break;
            }

            let joined = if cancel.is_cancelled() {
                tasks.join_next().await
            } else {
                let in_flight = tasks.len();
                tokio::select! {
                    joined = tasks.join_next() => joined,
                    _ = cancel.cancelled() => {
                        info!(in_flight, "Cancellation requested, draining slots");
                        continue;
                    }
                }
            };

            let (idx, offset, result) = match joined {
                Some(Ok(outcome)) => {
                    task_slots.retain(|_, slot| *slot != outcome.0);
                    outcome
                }
                Some(Err(join_error)) => {
                    let Some(idx) = task_slots.remove(&join_error.id()) else {
                        error!("Work task failed outside any slot: {}", join_error);
                        continue;
                    };
                    let offset = self.running_offset(idx)?;
                    let error = Error::ConsistencyFault(format!("work task failed: {}", join_error));
                    (idx, offset, Err(error))
                }
                None => break,
            };

            match result {
                Ok(unit) => {
                    if let Err(e) = self.on_success(idx, unit).await {
                        self.on_failure(idx, offset, e).await;
                    }
                }
                Err(e) => self.on_failure(idx, offset, e).await,
            }
        }

        self.ledger.checkpoint().await?;

        let summary = RunSummary {
            completed: self.completed,
            failed: self.failed,
            duplicates: self.duplicates,
            next_offset: self.watermark.value(),
            backlog: self.backlog.entries(),
            cancelled: cancel.is_cancelled(),
        };

        info!(
            completed = summary.completed,
            failed = summary.failed,
            duplicates = summary.duplicates,
            next_offset = summary.next_offset,
            backlog = summary.backlog.len(),
            cancelled = summary.cancelled,
            "Tracker stopped"
        );

        Ok(summary)
    }

    fn dispatch_idle(
        &mut self,
        tasks: &mut JoinSet<UnitOutcome>,
        task_slots: &mut HashMap<tokio::task::Id, usize>,
    ) -> Result<()> {
        for idx in 0..self.slots.len() {
            if !self.slots[idx].is_idle() {
                continue;
            }

            // Retries first, then fresh offsets
            let Some((offset, attempt)) = self
                .backlog
                .take_retry(self.config.retry_policy)
                .or_else(|| self.allocator.next().map(|offset| (offset, 1)))
            else {
                break;
            };

            let unit = WorkUnit::new(offset, &self.config.block_lengths)?;
            let slot = &mut self.slots[idx];
            slot.assign(offset, attempt)?;
            let cache = slot.cache();
            let id = slot.id;

            let handle = tasks.spawn(async move {
                let result = tokio::task::spawn_blocking(move || unit.work(&cache))
                    .await
                    .map_err(|e| Error::ConsistencyFault(format!("work unit panicked: {}", e)))
                    .and_then(|result| result);
                (idx, offset, result)
            });
            task_slots.insert(handle.id(), idx);

            debug!(slot = %id, offset, attempt, "Dispatched work unit");
            self.emit(MinerEvent::Dispatched {
                slot: id,
                offset,
                attempt,
            });
        }
        Ok(())
    }

    async fn on_success(&mut self, idx: usize, unit: WorkUnit) -> Result<()> {
        let offset = unit.start_offset();
        let first_digit = unit.first_digit()?;

        for (length, digit, hash) in unit.results()? {
            let duplicate = self.ledger.record(offset, length, digit, &hash).await?;
            if duplicate {
                self.duplicates += 1;
            }
            self.emit(MinerEvent::BlockHashed {
                offset,
                length,
                first_digit: digit,
                hash,
                duplicate,
            });
        }

        if self.watermark.complete(offset) {
            let next = self.watermark.value();
            for &length in &self.config.block_lengths {
                self.ledger.set_next_offset(length, next).await?;
            }
        }

        self.backlog.resolve(offset);
        let slot = &mut self.slots[idx];
        slot.release(true);
        let id = slot.id;
        self.completed += 1;
        metrics::record_unit(true);

        debug!(slot = %id, offset, first_digit, "Work unit completed");
        self.emit(MinerEvent::OffsetCompleted {
            slot: id,
            offset,
            first_digit,
        });

        self.since_checkpoint += 1;
        if self.config.checkpoint_interval > 0
            && self.since_checkpoint >= self.config.checkpoint_interval
        {
            self.checkpoint().await;
        }

        Ok(())
    }

    /// Periodic checkpoint; a failure is retried at the next interval and
    /// again at shutdown
    async fn checkpoint(&mut self) {
        match self.ledger.checkpoint().await {
            Ok(()) => {
                self.since_checkpoint = 0;
                debug!(next_offset = self.watermark.value(), "Checkpointed store");
            }
            Err(e) => error!("Checkpoint failed: {}", e),
        }
    }

    async fn on_failure(&mut self, idx: usize, offset: u64, error: Error) {
        let attempts = self.backlog.record(offset, &error);
        let cancelled = error.is_cancelled();

        // Settled failures stay in the backlog and no longer hold the cursor
        if self.backlog.is_settled(offset, self.config.retry_policy)
            && self.watermark.skip(offset)
        {
            let next = self.watermark.value();
            for &length in &self.config.block_lengths {
                if let Err(e) = self.ledger.set_next_offset(length, next).await {
                    error!(length, next, "Failed to store cursor: {}", e);
                }
            }
        }

        let failure = Error::GenerationFailure {
            offset,
            reason: error.to_string(),
        };

        let slot = &mut self.slots[idx];
        slot.release(false);
        let id = slot.id;
        self.failed += 1;
        metrics::record_unit(false);

        if cancelled {
            info!(slot = %id, offset, "Work unit cancelled");
        } else {
            warn!(slot = %id, offset, attempts, "{}", failure);
        }

        self.emit(MinerEvent::OffsetFailed {
            slot: id,
            offset,
            attempts,
            reason: error.to_string(),
            cancelled,
        });
    }

    fn running_offset(&self, idx: usize) -> Result<u64> {
        match self.slots.get(idx).map(Slot::state) {
            Some(SlotState::Running { offset, .. }) => Ok(offset),
            _ => Err(Error::ConsistencyFault(format!(
                "slot {} finished without a running offset",
                idx
            ))),
        }
    }

    fn emit(&self, event: MinerEvent) {
        if let Some(events) = &self.events {
            // A closed receiver only means nobody is watching
            let _ = events.send(event);
        }
    }
}

/// Offset a run should start from: the lowest stored cursor across the
/// configured block lengths when resuming, `config.start_offset` otherwise
pub async fn resume_offset(config: &MinerConfig, ledger: &PiLedger) -> Result<u64> {
    if !config.resume {
        return Ok(config.start_offset);
    }

    let mut lowest: Option<u64> = None;
    for &length in &config.block_lengths {
        if let Some(stored) = ledger.stored_next_offset(length).await? {
            lowest = Some(lowest.map_or(stored, |l| l.min(stored)));
        }
    }

    match lowest {
        Some(offset) => {
            info!(offset, "Resuming from stored cursor");
            Ok(offset)
        }
        None => Ok(config.start_offset),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DurableStore, MemoryStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    /// Memory store whose upserts of one key fail a set number of times
    struct FlakyStore {
        inner: MemoryStore,
        fail_key: String,
        failures_left: AtomicU32,
    }

    impl FlakyStore {
        fn new(inner: MemoryStore, fail_key: &str, failures: u32) -> Self {
            Self {
                inner,
                fail_key: fail_key.to_string(),
                failures_left: AtomicU32::new(failures),
            }
        }
    }

    #[async_trait]
    impl DurableStore for FlakyStore {
        async fn read(&self, key: &str) -> Result<Option<String>> {
            self.inner.read(key).await
        }

        async fn upsert(&self, key: &str, value: &str) -> Result<()> {
            if key == self.fail_key {
                let left = self.failures_left.load(Ordering::SeqCst);
                if left > 0 {
                    self.failures_left.store(left - 1, Ordering::SeqCst);
                    return Err(Error::Storage(format!("injected write failure on {}", key)));
                }
            }
            self.inner.upsert(key, value).await
        }

        async fn checkpoint(&self) -> Result<()> {
            self.inner.checkpoint().await
        }
    }

    fn config(slots: usize, end: u64) -> MinerConfig {
        MinerConfig {
            slots,
            block_lengths: vec![10, 20],
            end_offset: Some(end),
            cache_capacity_bytes: 64,
            checkpoint_interval: 0,
            ..MinerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_run_to_end_offset() -> Result<()> {
        let store = MemoryStore::new();
        let ledger = Arc::new(PiLedger::new(Arc::new(store.clone())));
        let mut tracker =
            Tracker::from_config(config(2, 100), Arc::clone(&ledger), CancellationToken::new())
                .await?;

        let summary = tracker.run().await?;
        assert_eq!(summary.completed, 10);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.next_offset, 100);
        assert!(!summary.cancelled);

        assert_eq!(ledger.next_offset(10).await?, 100);
        assert_eq!(ledger.next_offset(20).await?, 100);
        let entry = ledger.lookup(0, 10).await?.expect("offset 0 recorded");
        assert_eq!(entry.first_digit, 2);
        assert_eq!(store.checkpoint_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_dispatch_order_is_increasing() -> Result<()> {
        let ledger = Arc::new(PiLedger::new(Arc::new(MemoryStore::new())));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tracker = Tracker::from_config(config(3, 200), ledger, CancellationToken::new())
            .await?
            .with_events(tx);

        tracker.run().await?;
        drop(tracker);

        let mut dispatched = Vec::new();
        while let Some(event) = rx.recv().await {
            if let MinerEvent::Dispatched { offset, .. } = event {
                dispatched.push(offset);
            }
        }
        assert_eq!(dispatched, (0..200).step_by(10).collect::<Vec<u64>>());
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let ledger = Arc::new(PiLedger::new(Arc::new(MemoryStore::new())));
        let mut bad = config(0, 100);
        let result = Tracker::from_config(bad.clone(), Arc::clone(&ledger), CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));

        bad.slots = 1;
        bad.cache_capacity_bytes = 15;
        let result = Tracker::from_config(bad, ledger, CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_resume_offset_uses_lowest_cursor() -> Result<()> {
        let ledger = PiLedger::new(Arc::new(MemoryStore::new()));
        let mut config = config(1, 1000);
        config.start_offset = 7;

        assert_eq!(resume_offset(&config, &ledger).await?, 7);

        config.resume = true;
        assert_eq!(resume_offset(&config, &ledger).await?, 7);

        ledger.set_next_offset(10, 300).await?;
        ledger.set_next_offset(20, 250).await?;
        assert_eq!(resume_offset(&config, &ledger).await?, 250);
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_offset_lands_in_backlog() -> Result<()> {
        let ledger = Arc::new(PiLedger::new(Arc::new(MemoryStore::new())));
        let mut config = config(1, u64::MAX);
        config.start_offset = u64::MAX - 10;
        config.retry_policy = RetryPolicy::Redispatch { max_attempts: 3 };

        let mut tracker = Tracker::from_config(config, ledger, CancellationToken::new()).await?;
        let summary = tracker.run().await?;

        // Past the generator's range: invalid, never retried
        assert_eq!(summary.completed, 0);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.backlog.len(), 1);
        assert_eq!(summary.backlog[0].offset, u64::MAX - 10);
        assert!(!summary.backlog[0].retryable);
        Ok(())
    }

    #[tokio::test]
    async fn test_backlog_failure_does_not_hold_cursor() -> Result<()> {
        let store = MemoryStore::new();
        let flaky = FlakyStore::new(store.clone(), "n30:b10", u32::MAX);
        let ledger = Arc::new(PiLedger::new(Arc::new(flaky)));

        let mut tracker =
            Tracker::from_config(config(2, 100), Arc::clone(&ledger), CancellationToken::new())
                .await?;
        let summary = tracker.run().await?;

        assert_eq!(summary.completed, 9);
        assert_eq!(summary.failed, 1);
        let offsets: Vec<u64> = summary.backlog.iter().map(|f| f.offset).collect();
        assert_eq!(offsets, vec![30]);
        assert!(summary.backlog[0].retryable);
        assert!(!summary.backlog[0].cancelled);

        // Later offsets completed and the cursor passed the failed one
        assert_eq!(summary.next_offset, 100);
        assert_eq!(tracker.watermark().parked(), 0);
        assert_eq!(store.read("nextBlock:10").await?, Some("100".to_string()));
        assert!(ledger.lookup(90, 10).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_redispatch_recovers_failed_offset() -> Result<()> {
        let store = MemoryStore::new();
        let flaky = FlakyStore::new(store.clone(), "n30:b10", 1);
        let ledger = Arc::new(PiLedger::new(Arc::new(flaky)));
        let mut config = config(2, 100);
        config.retry_policy = RetryPolicy::Redispatch { max_attempts: 3 };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tracker = Tracker::from_config(config, Arc::clone(&ledger), CancellationToken::new())
            .await?
            .with_events(tx);
        let summary = tracker.run().await?;
        drop(tracker);

        assert_eq!(summary.completed, 10);
        assert_eq!(summary.failed, 1);
        assert!(summary.backlog.is_empty());
        assert_eq!(summary.next_offset, 100);
        assert_eq!(ledger.next_offset(10).await?, 100);
        assert!(ledger.lookup(30, 10).await?.is_some());

        let mut retried = Vec::new();
        while let Some(event) = rx.recv().await {
            if let MinerEvent::Dispatched {
                offset: 30,
                attempt,
                ..
            } = event
            {
                retried.push(attempt);
            }
        }
        assert_eq!(retried, vec![1, 2]);
        Ok(())
    }

    #[tokio::test]
    async fn test_redispatch_gives_up_after_max_attempts() -> Result<()> {
        let store = MemoryStore::new();
        let flaky = FlakyStore::new(store.clone(), "n30:b10", u32::MAX);
        let ledger = Arc::new(PiLedger::new(Arc::new(flaky)));
        let mut config = config(2, 100);
        config.retry_policy = RetryPolicy::Redispatch { max_attempts: 2 };

        let mut tracker = Tracker::from_config(config, ledger, CancellationToken::new()).await?;
        let summary = tracker.run().await?;

        assert_eq!(summary.completed, 9);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.backlog.len(), 1);
        assert_eq!(summary.backlog[0].attempts, 2);
        assert_eq!(summary.next_offset, 100);
        assert_eq!(store.read("nextBlock:20").await?, Some("100".to_string()));
        Ok(())
    }
}
