//! BBP Miner Binary
//!
//! Command-line interface for mining hash fingerprints of π digit blocks:
//! - Mining runs across concurrent worker slots (run)
//! - Stored result lookups (lookup, status)
//! - Raw digit extraction (digits)
//!
//! # Examples
//!
//! ```bash
//! # Mine from offset 0 with 8 slots until Ctrl-C
//! bbp-miner run --slots 8
//!
//! # Mine a fixed range with small blocks
//! bbp-miner run --block-lengths 10,20 --end-offset 1000
//!
//! # Pick up where the last run stopped
//! bbp-miner run --resume
//!
//! # Show the stored result for one block
//! bbp-miner lookup --offset 120 --block 10
//!
//! # Print 32 hex digits starting at position 1000000
//! bbp-miner digits --offset 1000000 --count 32
//! ```

use bbp_miner::digits::hex_digits;
use bbp_miner::metrics;
use bbp_miner::scheduler::{MinerEvent, RetryPolicy, Tracker};
use bbp_miner::store::{LogStore, PiLedger};
use bbp_miner::MinerConfig;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// BBP Miner - hash fingerprints of π digit blocks
#[derive(Parser, Debug)]
#[command(name = "bbp-miner")]
#[command(version = bbp_miner::VERSION)]
#[command(about = "Hash fingerprints of π digit blocks at arbitrary offsets", long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(long, global = true, env = "BBP_MINER_CONFIG")]
    config: Option<PathBuf>,

    /// Store base directory (overrides the configuration file)
    #[arg(long, global = true, env = "BBP_MINER_BASE_DIR")]
    base_dir: Option<PathBuf>,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "BBP_MINER_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Mine offsets until Ctrl-C or the end offset
    Run(RunArgs),

    /// Show the stored result for one block
    Lookup {
        /// Starting offset of the block
        #[arg(long)]
        offset: u64,
        /// Block length in bytes
        #[arg(long)]
        block: usize,
    },

    /// Show the resume cursor per block length
    Status,

    /// Print hex digits straight from the generator
    Digits {
        /// Position of the first digit after the hexadecimal point
        #[arg(long, default_value = "0")]
        offset: u64,
        /// Number of hex digits
        #[arg(long, default_value = "16")]
        count: usize,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum RetryMode {
    Backlog,
    Redispatch,
}

/// Mining arguments; each one overrides the configuration file
#[derive(Args, Debug)]
struct RunArgs {
    /// Concurrent worker slots
    #[arg(long, env = "BBP_MINER_SLOTS")]
    slots: Option<usize>,

    /// Block lengths in bytes, comma separated
    #[arg(long, value_delimiter = ',')]
    block_lengths: Option<Vec<usize>>,

    /// First offset to mine
    #[arg(long)]
    start_offset: Option<u64>,

    /// Stop before this offset
    #[arg(long)]
    end_offset: Option<u64>,

    /// Per-slot digit cache capacity in bytes
    #[arg(long)]
    cache_capacity: Option<usize>,

    /// What to do with failed offsets
    #[arg(long, value_enum)]
    retry: Option<RetryMode>,

    /// Attempts per offset when redispatching
    #[arg(long, default_value = "3")]
    max_attempts: u32,

    /// Start from the stored resume cursor
    #[arg(long)]
    resume: bool,

    /// Checkpoint after this many completed offsets
    #[arg(long)]
    checkpoint_interval: Option<u64>,
}

impl RunArgs {
    fn apply(&self, config: &mut MinerConfig) {
        if let Some(slots) = self.slots {
            config.slots = slots;
        }
        if let Some(lengths) = &self.block_lengths {
            config.block_lengths = lengths.clone();
        }
        if let Some(start) = self.start_offset {
            config.start_offset = start;
        }
        if self.end_offset.is_some() {
            config.end_offset = self.end_offset;
        }
        if let Some(capacity) = self.cache_capacity {
            config.cache_capacity_bytes = capacity;
        }
        match self.retry {
            Some(RetryMode::Backlog) => config.retry_policy = RetryPolicy::Backlog,
            Some(RetryMode::Redispatch) => {
                config.retry_policy = RetryPolicy::Redispatch {
                    max_attempts: self.max_attempts,
                }
            }
            None => {}
        }
        if self.resume {
            config.resume = true;
        }
        if let Some(interval) = self.checkpoint_interval {
            config.checkpoint_interval = interval;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli)?;

    let config = load_config(&cli)?;

    // Execute command
    match cli.command {
        Commands::Run(args) => run_command(config, args).await,
        Commands::Lookup { offset, block } => lookup_command(config, offset, block).await,
        Commands::Status => status_command(config).await,
        Commands::Digits { offset, count } => {
            println!("{}", hex_digits(offset, count)?);
            Ok(())
        }
    }
}

/// Setup logging with rolling files and console output
///
/// Console logs go to stderr; stdout carries results.
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "bbp-miner.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color)
                .compact(),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<MinerConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            MinerConfig::from_toml_file(path)?
        }
        None => MinerConfig::default(),
    };
    if let Some(base_dir) = &cli.base_dir {
        config.base_dir = base_dir.clone();
    }
    Ok(config)
}

/// Run command - mine until Ctrl-C or the end offset
async fn run_command(mut config: MinerConfig, args: RunArgs) -> anyhow::Result<()> {
    args.apply(&mut config);
    config.validate()?;

    info!("BBP miner starting...");
    info!(version = %bbp_miner::VERSION, "Version information");
    metrics::init_metrics();

    let store = Arc::new(LogStore::open(&config.base_dir)?);
    info!(path = %store.log_path().display(), keys = store.len(), "Store opened");
    let ledger = Arc::new(PiLedger::new(store.clone()));

    let cancel = CancellationToken::new();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut tracker = Tracker::from_config(config, ledger, cancel.clone())
        .await?
        .with_events(events_tx);

    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            print_event(&event);
        }
    });

    let signal_token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, finishing in-flight work");
                signal_token.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    let summary = tracker.run().await?;
    // Closes the event channel
    drop(tracker);
    printer.await?;

    if let Err(e) = store.compact() {
        warn!("Store compaction failed: {}", e);
    }

    println!(
        "completed={} failed={} duplicates={} next_offset={} backlog={}",
        summary.completed,
        summary.failed,
        summary.duplicates,
        summary.next_offset,
        summary.backlog.len()
    );
    for failed in summary.backlog.iter().filter(|f| !f.cancelled) {
        eprintln!(
            "backlog offset={} attempts={} error={}",
            failed.offset, failed.attempts, failed.last_error
        );
    }

    match metrics::export_metrics() {
        Ok(text) => info!("Final metrics:\n{}", text),
        Err(e) => warn!("Failed to export metrics: {}", e),
    }

    info!("Shutdown complete");
    Ok(())
}

fn print_event(event: &MinerEvent) {
    match event {
        MinerEvent::Dispatched { .. } => {}
        MinerEvent::BlockHashed {
            offset,
            length,
            first_digit,
            hash,
            duplicate,
        } => {
            let marker = if *duplicate { " duplicate" } else { "" };
            println!("n{}:b{} {:X}:{}{}", offset, length, first_digit, hash, marker);
        }
        MinerEvent::OffsetCompleted {
            slot,
            offset,
            first_digit,
        } => {
            println!("offset {} done on {} (first digit {:X})", offset, slot, first_digit);
        }
        MinerEvent::OffsetFailed {
            slot,
            offset,
            attempts,
            reason,
            cancelled,
        } => {
            if *cancelled {
                eprintln!("offset {} cancelled on {}", offset, slot);
            } else {
                eprintln!(
                    "offset {} failed on {} (attempt {}): {}",
                    offset, slot, attempts, reason
                );
            }
        }
    }
}

/// Lookup command - show one stored block and the offsets sharing its hash
async fn lookup_command(config: MinerConfig, offset: u64, block: usize) -> anyhow::Result<()> {
    let store = Arc::new(LogStore::open(&config.base_dir)?);
    let ledger = PiLedger::new(store);

    match ledger.lookup(offset, block).await? {
        Some(entry) => {
            println!("n{}:b{}", offset, block);
            println!("  first digit: {:X}", entry.first_digit);
            println!("  sha256:      {}", entry.hash_hex);

            let offsets = ledger.offsets_for(block, &entry.hash_hex).await?;
            let joined = offsets
                .iter()
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            println!("  offsets:     {}", joined);
        }
        None => {
            println!("No result stored for offset {} block {}", offset, block);
        }
    }
    Ok(())
}

/// Status command - resume cursor per configured block length
async fn status_command(config: MinerConfig) -> anyhow::Result<()> {
    let store = Arc::new(LogStore::open(&config.base_dir)?);
    let keys = store.len();
    let ledger = PiLedger::new(store);

    println!("Store: {} ({} keys)", config.base_dir.display(), keys);
    println!("───────────────────────────────");
    for &length in &config.block_lengths {
        match ledger.stored_next_offset(length).await? {
            Some(next) => println!("  b{:<6} next offset {}", length, next),
            None => println!("  b{:<6} not started", length),
        }
    }
    Ok(())
}
