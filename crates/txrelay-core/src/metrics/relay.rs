//! Prometheus metrics for the relay loop.

use crate::{Error, Result};
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Commit latency buckets in seconds.
const COMMIT_DURATION_BUCKETS: [f64; 9] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5];

/// Batch size buckets in records.
const BATCH_SIZE_BUCKETS: [f64; 8] = [1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0];

/// Relay metrics registered in a private Prometheus registry.
pub struct RelayMetrics {
    registry: Registry,
    records_relayed: IntCounter,
    transactions_committed: IntCounter,
    transactions_aborted: IntCounterVec,
    retries: IntCounter,
    fencing_events: IntCounter,
    errors: IntCounterVec,
    consumer_lag: IntGauge,
    commit_duration: Histogram,
    batch_size: Histogram,
}

fn registration(e: prometheus::Error) -> Error {
    Error::Metrics(e.to_string())
}

impl RelayMetrics {
    /// Create and register all relay metrics.
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("txrelay".into()), None).map_err(registration)?;

        let records_relayed = IntCounter::new(
            "records_relayed_total",
            "Records republished in committed transactions",
        )
        .map_err(registration)?;
        let transactions_committed =
            IntCounter::new("transactions_committed_total", "Committed transactions")
                .map_err(registration)?;
        let transactions_aborted = IntCounterVec::new(
            Opts::new("transactions_aborted_total", "Aborted transactions by reason"),
            &["reason"],
        )
        .map_err(registration)?;
        let retries = IntCounter::new("retries_total", "Batches retried after an abort")
            .map_err(registration)?;
        let fencing_events = IntCounter::new(
            "fencing_events_total",
            "Transactional identity lost to another session",
        )
        .map_err(registration)?;
        let errors = IntCounterVec::new(
            Opts::new("errors_total", "Relay errors by kind"),
            &["kind"],
        )
        .map_err(registration)?;
        let consumer_lag = IntGauge::new(
            "consumer_lag",
            "Source records past the group's committed offsets",
        )
        .map_err(registration)?;
        let commit_duration = Histogram::with_opts(
            HistogramOpts::new("commit_duration_seconds", "Transaction commit latency")
                .buckets(COMMIT_DURATION_BUCKETS.to_vec()),
        )
        .map_err(registration)?;
        let batch_size = Histogram::with_opts(
            HistogramOpts::new("batch_size_records", "Records per relayed batch")
                .buckets(BATCH_SIZE_BUCKETS.to_vec()),
        )
        .map_err(registration)?;

        registry
            .register(Box::new(records_relayed.clone()))
            .map_err(registration)?;
        registry
            .register(Box::new(transactions_committed.clone()))
            .map_err(registration)?;
        registry
            .register(Box::new(transactions_aborted.clone()))
            .map_err(registration)?;
        registry
            .register(Box::new(retries.clone()))
            .map_err(registration)?;
        registry
            .register(Box::new(fencing_events.clone()))
            .map_err(registration)?;
        registry
            .register(Box::new(errors.clone()))
            .map_err(registration)?;
        registry
            .register(Box::new(consumer_lag.clone()))
            .map_err(registration)?;
        registry
            .register(Box::new(commit_duration.clone()))
            .map_err(registration)?;
        registry
            .register(Box::new(batch_size.clone()))
            .map_err(registration)?;

        Ok(Self {
            registry,
            records_relayed,
            transactions_committed,
            transactions_aborted,
            retries,
            fencing_events,
            errors,
            consumer_lag,
            commit_duration,
            batch_size,
        })
    }

    // === RECORDING ===

    /// Record a committed batch.
    pub fn record_commit(&self, records: usize, duration: Duration) {
        self.transactions_committed.inc();
        self.records_relayed.inc_by(records as u64);
        self.commit_duration.observe(duration.as_secs_f64());
        self.batch_size.observe(records as f64);
    }

    /// Record an aborted batch.
    pub fn record_abort(&self, reason: &str) {
        self.transactions_aborted.with_label_values(&[reason]).inc();
    }

    /// Record a retry of an aborted batch.
    pub fn record_retry(&self) {
        self.retries.inc();
    }

    /// Record loss of the transactional identity.
    pub fn record_fencing(&self) {
        self.fencing_events.inc();
    }

    /// Record an error by kind label.
    pub fn record_error(&self, kind: &str) {
        self.errors.with_label_values(&[kind]).inc();
    }

    /// Update the consumer lag: high watermark minus committed offset,
    /// summed over partitions.
    pub fn set_consumer_lag(&self, lag: i64) {
        self.consumer_lag.set(lag);
    }

    // === GETTERS ===

    /// Records relayed in committed transactions.
    pub fn records_relayed_total(&self) -> u64 {
        self.records_relayed.get()
    }

    /// Committed transactions.
    pub fn transactions_committed_total(&self) -> u64 {
        self.transactions_committed.get()
    }

    /// Aborted transactions for one reason.
    pub fn transactions_aborted(&self, reason: &str) -> u64 {
        self.transactions_aborted.with_label_values(&[reason]).get()
    }

    /// Retried batches.
    pub fn retries_total(&self) -> u64 {
        self.retries.get()
    }

    /// Fencing events.
    pub fn fencing_events_total(&self) -> u64 {
        self.fencing_events.get()
    }

    /// Errors of one kind.
    pub fn errors(&self, kind: &str) -> u64 {
        self.errors.with_label_values(&[kind]).get()
    }

    /// Current consumer lag.
    pub fn consumer_lag(&self) -> i64 {
        self.consumer_lag.get()
    }

    /// Export all metrics in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .map_err(registration)
    }
}
