//! Prometheus metrics for the miner
//!
//! Counters are process-wide and cheap to bump from worker threads; the CLI
//! renders them once at shutdown.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::info;

lazy_static::lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    pub static ref WORK_UNITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("bbp_work_units_total", "Work units finished, by status"),
        &["status"]
    ).expect("valid work unit counter");

    pub static ref DIGIT_BYTES_GENERATED: IntCounter = IntCounter::new(
        "bbp_digit_bytes_generated_total",
        "Packed digit bytes produced by the BBP generator"
    ).expect("valid generated bytes counter");

    pub static ref CACHE_BYTES_EVICTED: IntCounter = IntCounter::new(
        "bbp_cache_bytes_evicted_total",
        "Digit bytes dropped from cache windows"
    ).expect("valid evicted bytes counter");

    pub static ref DEDUP_COLLISIONS: IntCounter = IntCounter::new(
        "bbp_dedup_collisions_total",
        "Block hashes already recorded at another offset"
    ).expect("valid collision counter");

    pub static ref BUSY_SLOTS: IntGauge = IntGauge::new(
        "bbp_busy_slots",
        "Worker slots currently running a work unit"
    ).expect("valid busy slot gauge");
}

/// Initialize metrics registry
pub fn init_metrics() {
    info!("Initializing Prometheus metrics");

    METRICS_REGISTRY.register(Box::new(WORK_UNITS_TOTAL.clone())).ok();
    METRICS_REGISTRY.register(Box::new(DIGIT_BYTES_GENERATED.clone())).ok();
    METRICS_REGISTRY.register(Box::new(CACHE_BYTES_EVICTED.clone())).ok();
    METRICS_REGISTRY.register(Box::new(DEDUP_COLLISIONS.clone())).ok();
    METRICS_REGISTRY.register(Box::new(BUSY_SLOTS.clone())).ok();
}

/// Record the outcome of one work unit
pub fn record_unit(success: bool) {
    let status = if success { "success" } else { "error" };
    WORK_UNITS_TOTAL.with_label_values(&[status]).inc();
}

/// Export metrics in Prometheus text format
pub fn export_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("UTF-8 conversion error: {}", e)))
}
