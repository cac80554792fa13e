//! End-to-end mining runs against the on-disk store

use bbp_miner::digits::generate;
use bbp_miner::error::Result;
use bbp_miner::scheduler::{MinerEvent, RetryPolicy, Tracker};
use bbp_miner::store::{LogStore, MemoryStore, PiLedger};
use bbp_miner::{BlockHash, MinerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("bbp_miner_{}_{}", name, std::process::id()));
    std::fs::remove_dir_all(&dir).ok();
    dir
}

fn small_config(base_dir: PathBuf, end: u64) -> MinerConfig {
    MinerConfig {
        base_dir,
        slots: 2,
        block_lengths: vec![10, 20],
        start_offset: 0,
        end_offset: Some(end),
        cache_capacity_bytes: 64,
        retry_policy: RetryPolicy::Backlog,
        resume: false,
        checkpoint_interval: 3,
    }
}

#[tokio::test]
async fn test_run_persists_results() -> Result<()> {
    let dir = temp_dir("persist");
    let config = small_config(dir.clone(), 100);

    {
        let store = Arc::new(LogStore::open(&dir)?);
        let ledger = Arc::new(PiLedger::new(store));
        let mut tracker =
            Tracker::from_config(config.clone(), ledger, CancellationToken::new()).await?;
        let summary = tracker.run().await?;
        assert_eq!(summary.completed, 10);
        assert!(summary.backlog.is_empty());
    }

    let store = Arc::new(LogStore::open(&dir)?);
    let ledger = PiLedger::new(store);

    for offset in (0..100u64).step_by(10) {
        let digits = generate(offset, 20)?;
        for length in [10usize, 20] {
            let entry = ledger
                .lookup(offset, length)
                .await?
                .expect("block recorded");
            assert_eq!(entry.first_digit, digits[0] >> 4);
            assert_eq!(entry.hash_hex, BlockHash::of(&digits[..length]).to_hex());

            let offsets = ledger.offsets_for(length, &entry.hash_hex).await?;
            assert!(offsets.contains(&offset));
        }
    }
    assert_eq!(ledger.next_offset(10).await?, 100);
    assert_eq!(ledger.next_offset(20).await?, 100);

    std::fs::remove_dir_all(dir).ok();
    Ok(())
}

#[tokio::test]
async fn test_resume_continues_after_stored_cursor() -> Result<()> {
    let dir = temp_dir("resume");

    {
        let store = Arc::new(LogStore::open(&dir)?);
        let ledger = Arc::new(PiLedger::new(store));
        let mut tracker =
            Tracker::from_config(small_config(dir.clone(), 60), ledger, CancellationToken::new())
                .await?;
        tracker.run().await?;
    }

    let store = Arc::new(LogStore::open(&dir)?);
    let ledger = Arc::new(PiLedger::new(store));
    let mut config = small_config(dir.clone(), 120);
    config.resume = true;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut tracker = Tracker::from_config(config, Arc::clone(&ledger), CancellationToken::new())
        .await?
        .with_events(tx);
    let summary = tracker.run().await?;
    drop(tracker);

    let mut dispatched = Vec::new();
    while let Some(event) = rx.recv().await {
        if let MinerEvent::Dispatched { offset, .. } = event {
            dispatched.push(offset);
        }
    }

    assert_eq!(dispatched, vec![60, 70, 80, 90, 100, 110]);
    assert_eq!(summary.next_offset, 120);
    assert!(ledger.lookup(0, 10).await?.is_some());
    assert!(ledger.lookup(110, 20).await?.is_some());

    std::fs::remove_dir_all(dir).ok();
    Ok(())
}

#[tokio::test]
async fn test_rerun_does_not_duplicate_offsets() -> Result<()> {
    let store = MemoryStore::new();
    let ledger = Arc::new(PiLedger::new(Arc::new(store.clone())));
    let config = small_config(temp_dir("rerun"), 50);

    for _ in 0..2 {
        let mut tracker =
            Tracker::from_config(config.clone(), Arc::clone(&ledger), CancellationToken::new())
                .await?;
        let summary = tracker.run().await?;
        assert_eq!(summary.completed, 5);
        assert_eq!(summary.duplicates, 0);
    }

    let hash = BlockHash::of(&generate(30, 10)?);
    assert_eq!(ledger.offsets_for(10, &hash.to_hex()).await?, vec![30]);
    // 5 offsets x 2 lengths, each with a result key and a hash list, plus 2 cursors
    assert_eq!(store.len(), 22);
    Ok(())
}

#[tokio::test]
async fn test_cancellation_fills_backlog() -> Result<()> {
    let store = MemoryStore::new();
    let ledger = Arc::new(PiLedger::new(Arc::new(store.clone())));
    let config = MinerConfig {
        slots: 2,
        block_lengths: vec![10],
        start_offset: 1_000_000_000,
        end_offset: None,
        cache_capacity_bytes: 32,
        checkpoint_interval: 0,
        ..MinerConfig::default()
    };

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut tracker = Tracker::from_config(config, ledger, cancel.clone())
        .await?
        .with_events(tx);

    let run = tokio::spawn(async move { tracker.run().await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    let summary = tokio::time::timeout(Duration::from_secs(30), run)
        .await
        .expect("tracker drains after cancellation")
        .expect("tracker task")?;

    assert!(summary.cancelled);
    assert_eq!(summary.completed, 0);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.backlog.len(), 2);
    assert!(summary.backlog.iter().all(|f| f.cancelled));
    assert_eq!(
        summary.backlog.iter().map(|f| f.offset).collect::<Vec<_>>(),
        vec![1_000_000_000, 1_000_000_010]
    );

    // The final checkpoint still happens
    assert_eq!(store.checkpoint_count(), 1);

    let mut failures = 0;
    while let Some(event) = rx.recv().await {
        if let MinerEvent::OffsetFailed { cancelled, .. } = event {
            assert!(cancelled);
            failures += 1;
        }
    }
    assert_eq!(failures, 2);
    Ok(())
}
