//! The relay loop: consume, transform, republish and advance offsets as one
//! transaction per batch.
//!
//! ```text
//! Idle -> Polling -> HasBatch -> Transacting -> Committing -> Idle
//!            |                        |              |
//!            +-> Idle (empty)         +-> Aborting <-+-> Idle
//! ```
//!
//! Spans for a batch are exported only after its transaction commits. An
//! aborted batch discards its spans and rewinds the source onto its first
//! record per partition, so the next poll redelivers it.

use crate::config::Config;
use crate::health::{HealthCheck, COMPONENT_RELAY, COMPONENT_SINK, COMPONENT_SOURCE};
use crate::kafka::{
    BatchOffsets, OffsetTracker, OutboundRecord, PendingAck, Record, RecordSource, RetryConfig,
    TransactionHandle, TransactionalSink,
};
use crate::metrics::RelayMetrics;
use crate::propagation;
use crate::span::{BatchSpans, LogSpanExporter, Span, SpanExporter};
use opentelemetry::trace::SpanKind;
use crate::transform::{Passthrough, Transform};
use crate::{Error, Result, TransactionError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// Observable position of the relay in its iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Between iterations
    Idle,
    /// Waiting for records
    Polling,
    /// A non-empty batch was received
    HasBatch,
    /// Records are being enqueued in a transaction
    Transacting,
    /// Offsets registered, commit in progress
    Committing,
    /// The transaction is being rolled back
    Aborting,
    /// The loop has exited
    Stopped,
}

/// Result of a single relay iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum IterationOutcome {
    /// The poll returned no records
    Idle,
    /// A batch was committed
    Committed {
        /// Records relayed in the batch
        records: usize,
    },
    /// The batch was rolled back and will be redelivered
    Aborted {
        /// Why the batch was rolled back
        reason: TransactionError,
    },
}

/// Totals reported when the loop exits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Committed batches
    pub batches_committed: u64,
    /// Records relayed in committed batches
    pub records_relayed: u64,
    /// Rolled back batches
    pub batches_aborted: u64,
}

/// Immutable relay settings.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Topic outgoing records are produced to
    pub destination_topic: String,
    /// Upper bound for one poll
    pub poll_timeout: Duration,
    /// Backoff between failed batches
    pub retry: RetryConfig,
    /// Service name recorded on spans
    pub service_name: String,
}

impl RelaySettings {
    /// Settings with default poll timeout and retry policy.
    pub fn new(destination_topic: impl Into<String>) -> Self {
        Self {
            destination_topic: destination_topic.into(),
            poll_timeout: Duration::from_secs(1),
            retry: RetryConfig::default(),
            service_name: "txrelay".to_string(),
        }
    }

    /// Derive settings from a validated configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            destination_topic: config.kafka.destination_topic.clone(),
            poll_timeout: Duration::from_millis(config.kafka.batch_timeout_ms),
            retry: RetryConfig::from(&config.relay),
            service_name: config.relay.service_name.clone(),
        }
    }
}

/// Builder for a `Relay`.
pub struct RelayBuilder<S, K> {
    source: S,
    sink: K,
    settings: RelaySettings,
    transform: Arc<dyn Transform>,
    exporter: Option<Arc<dyn SpanExporter>>,
    metrics: Option<Arc<RelayMetrics>>,
    health: Option<Arc<HealthCheck>>,
    shutdown: Option<broadcast::Receiver<()>>,
}

impl<S: RecordSource, K: TransactionalSink> RelayBuilder<S, K> {
    /// Set the payload transform (default: pass-through).
    pub fn transform(mut self, transform: Arc<dyn Transform>) -> Self {
        self.transform = transform;
        self
    }

    /// Set the span exporter (default: log exporter).
    pub fn exporter(mut self, exporter: Arc<dyn SpanExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Record metrics.
    pub fn metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Report component health.
    pub fn health(mut self, health: Arc<HealthCheck>) -> Self {
        self.health = Some(health);
        self
    }

    /// Stop at the next checkpoint once `shutdown` fires. `run` replaces it
    /// with its own receiver.
    pub fn shutdown(mut self, shutdown: broadcast::Receiver<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Build the relay.
    pub fn build(self) -> Relay<S, K> {
        let exporter = self.exporter.unwrap_or_else(|| {
            Arc::new(LogSpanExporter::new(self.settings.service_name.clone()))
        });
        let (state_tx, _) = watch::channel(RelayState::Idle);

        Relay {
            source: self.source,
            sink: self.sink,
            settings: self.settings,
            transform: self.transform,
            exporter,
            metrics: self.metrics,
            health: self.health,
            offsets: OffsetTracker::new(),
            state_tx,
            shutdown: self.shutdown,
            cancelled: false,
            initialized: false,
            consecutive_failures: 0,
            stats: RelayStats::default(),
        }
    }
}

/// One source, one sink, one batch at a time.
pub struct Relay<S, K> {
    source: S,
    sink: K,
    settings: RelaySettings,
    transform: Arc<dyn Transform>,
    exporter: Arc<dyn SpanExporter>,
    metrics: Option<Arc<RelayMetrics>>,
    health: Option<Arc<HealthCheck>>,
    offsets: OffsetTracker,
    state_tx: watch::Sender<RelayState>,
    shutdown: Option<broadcast::Receiver<()>>,
    cancelled: bool,
    initialized: bool,
    consecutive_failures: u32,
    stats: RelayStats,
}

impl<S: RecordSource, K: TransactionalSink> Relay<S, K> {
    /// Start building a relay.
    pub fn builder(source: S, sink: K, settings: RelaySettings) -> RelayBuilder<S, K> {
        RelayBuilder {
            source,
            sink,
            settings,
            transform: Arc::new(Passthrough),
            exporter: None,
            metrics: None,
            health: None,
            shutdown: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> RelayState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<RelayState> {
        self.state_tx.subscribe()
    }

    /// Totals so far.
    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Consecutive failed iterations since the last commit.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Consumed and committed positions.
    pub fn offsets(&self) -> &OffsetTracker {
        &self.offsets
    }

    /// The source, for inspection.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// The sink, for inspection.
    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Register the transactional identity. Idempotent.
    pub async fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }

        if !self.source.commit_is_manual() {
            return Err(Error::Config(
                "record source must not advance offsets on its own".into(),
            ));
        }

        if let Err(e) = self.sink.init().await {
            self.mark_unhealthy(COMPONENT_SINK, &e.to_string());
            if e.is_fencing() {
                self.record_fencing();
            }
            return Err(e);
        }

        self.initialized = true;
        self.mark_healthy(COMPONENT_SINK);
        info!(
            transactional_id = %self.sink.transactional_id(),
            destination = %self.settings.destination_topic,
            "Relay initialized"
        );
        Ok(())
    }

    /// Loop until shutdown or a fatal error, then release the source and sink.
    pub async fn run(&mut self, shutdown: broadcast::Receiver<()>) -> Result<RelayStats> {
        self.shutdown = Some(shutdown);

        let result = self.run_loop().await;

        self.set_state(RelayState::Stopped);
        if let Some(health) = &self.health {
            health.relay_stopped();
        }

        let source_closed = self.source.close().await;
        let sink_closed = self.sink.close().await;

        match &result {
            Ok(()) => info!(
                batches = self.stats.batches_committed,
                records = self.stats.records_relayed,
                aborted = self.stats.batches_aborted,
                "Relay stopped"
            ),
            Err(e) => error!(error = %e, "Relay stopped on fatal error"),
        }

        result?;
        source_closed?;
        sink_closed?;
        Ok(self.stats.clone())
    }

    async fn run_loop(&mut self) -> Result<()> {
        self.init().await?;
        if let Some(health) = &self.health {
            health.relay_started();
        }

        while !self.is_cancelled() {
            match self.run_once().await? {
                IterationOutcome::Idle | IterationOutcome::Committed { .. } => {}
                IterationOutcome::Aborted { .. } => {
                    if self.consecutive_failures > 0 && !self.is_cancelled() {
                        let delay = self
                            .settings
                            .retry
                            .calculate_delay(self.consecutive_failures - 1);
                        debug!(delay_ms = delay.as_millis() as u64, "Backing off before retry");
                        self.sleep_unless_cancelled(delay).await;
                    }
                }
            }
        }

        Ok(())
    }

    /// Perform exactly one iteration.
    pub async fn run_once(&mut self) -> Result<IterationOutcome> {
        self.init().await?;

        // Nothing is in flight: revocations only invalidate tracked positions
        for (topic, partition) in self.source.take_revoked() {
            self.offsets.forget(&topic, partition);
        }

        if self.is_cancelled() {
            return Ok(IterationOutcome::Idle);
        }

        self.set_state(RelayState::Polling);
        let batch = match self.poll().await {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                self.set_state(RelayState::Idle);
                return Ok(IterationOutcome::Idle);
            }
            Err(e) => {
                self.set_state(RelayState::Idle);
                self.mark_degraded(COMPONENT_SOURCE, &e.to_string());
                return self.handle_failure(e);
            }
        };
        self.mark_healthy(COMPONENT_SOURCE);

        if batch.is_empty() {
            self.set_state(RelayState::Idle);
            return Ok(IterationOutcome::Idle);
        }

        self.set_state(RelayState::HasBatch);
        self.relay_batch(batch).await
    }

    /// Poll, racing the shutdown signal. `None` when shutdown won.
    async fn poll(&mut self) -> Result<Option<Vec<Record>>> {
        let poll = self.source.poll(self.settings.poll_timeout);

        let polled = match self.shutdown.as_mut() {
            Some(shutdown) => tokio::select! {
                batch = poll => Some(batch),
                _ = shutdown.recv() => None,
            },
            None => Some(poll.await),
        };

        match polled {
            Some(batch) => batch.map(Some),
            None => {
                self.cancelled = true;
                Ok(None)
            }
        }
    }

    async fn relay_batch(&mut self, batch: Vec<Record>) -> Result<IterationOutcome> {
        let offsets = BatchOffsets::from_records(&batch);
        for record in &batch {
            self.offsets
                .update_current(&record.topic, record.partition, record.offset);
        }

        debug!(records = batch.len(), "Relaying batch");
        self.set_state(RelayState::Transacting);

        let handle = match self.sink.begin().await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "Failed to begin transaction");
                return self.roll_back(None, e, &offsets, BatchSpans::new()).await;
            }
        };

        let mut spans = BatchSpans::new();
        let mut acks = Vec::with_capacity(batch.len());

        if let Err(e) = self
            .transact(&handle, &batch, &offsets, &mut spans, &mut acks)
            .await
        {
            return self.roll_back(Some(handle), e, &offsets, spans).await;
        }

        self.set_state(RelayState::Committing);
        if let Err(e) = self.check_interrupted(&offsets) {
            return self.roll_back(Some(handle), e, &offsets, spans).await;
        }

        let started = Instant::now();
        if let Err(e) = self.sink.commit(handle).await {
            warn!(error = %e, "Commit failed");
            // A failed commit has already been rolled back by the sink
            return self.roll_back(None, e, &offsets, spans).await;
        }
        let commit_duration = started.elapsed();

        for mark in offsets.commit_marks().values() {
            self.offsets.mark_committed(mark);
        }
        let exported = spans.export(self.exporter.as_ref());

        for ack in acks {
            match ack.await {
                Ok(ack) => debug!(
                    topic = %ack.topic,
                    partition = ack.partition,
                    offset = ack.offset,
                    "Record acknowledged"
                ),
                Err(e) => warn!(error = %e, "Committed record reported no acknowledgment"),
            }
        }

        let records = batch.len();
        self.consecutive_failures = 0;
        self.stats.batches_committed += 1;
        self.stats.records_relayed += records as u64;
        if let Some(metrics) = &self.metrics {
            for mark in offsets.commit_marks().values() {
                if let Some(end) = self.source.end_offset(&mark.topic, mark.partition) {
                    self.offsets.update_end(&mark.topic, mark.partition, end);
                }
            }
            metrics.record_commit(records, commit_duration);
            metrics.set_consumer_lag(self.offsets.total_lag());
        }
        self.mark_healthy(COMPONENT_RELAY);
        self.mark_healthy(COMPONENT_SINK);

        info!(
            records,
            spans = exported,
            commit_ms = commit_duration.as_millis() as u64,
            "Batch committed"
        );
        self.set_state(RelayState::Idle);
        Ok(IterationOutcome::Committed { records })
    }

    /// Enqueue every record of the batch and register its offsets.
    async fn transact(
        &mut self,
        handle: &TransactionHandle,
        batch: &[Record],
        offsets: &BatchOffsets,
        spans: &mut BatchSpans,
        acks: &mut Vec<PendingAck>,
    ) -> Result<()> {
        for record in batch {
            self.check_interrupted(offsets)?;
            let outbound = self.prepare(record, spans)?;
            acks.push(self.sink.enqueue(handle, outbound).await?);
        }

        self.check_interrupted(offsets)?;
        let group = self.source.group()?;
        self.sink
            .register_offsets(handle, &offsets.commit_marks(), &group)
            .await
    }

    /// Build the outgoing record and its consumer/internal/producer spans.
    fn prepare(&self, record: &Record, spans: &mut BatchSpans) -> Result<OutboundRecord> {
        let upstream = propagation::extract(&record.headers);

        let mut consumer = Span::root("consume message", SpanKind::Consumer);
        consumer.add_link(propagation::link(upstream.as_ref()));
        consumer.set_attribute("service.name", self.settings.service_name.clone());
        consumer.set_attribute("messaging.system", "kafka");
        consumer.set_attribute("messaging.source.name", record.topic.clone());
        consumer.set_attribute("messaging.kafka.partition", i64::from(record.partition));
        consumer.set_attribute("messaging.kafka.offset", record.offset);

        let mut process = Span::child_of(&consumer, "process message", SpanKind::Internal);
        process.set_attribute("payload.bytes", record.value.len() as i64);

        let transformed = self.transform.apply(record).map_err(|e| {
            TransactionError::Serialization {
                topic: record.topic.clone(),
                partition: record.partition,
                offset: record.offset,
                message: e.to_string(),
            }
        })?;

        let mut producer = Span::child_of(&process, "produce message", SpanKind::Producer);
        producer.set_attribute("messaging.system", "kafka");
        producer.set_attribute(
            "messaging.destination.name",
            self.settings.destination_topic.clone(),
        );

        let headers = propagation::inject(&record.headers, &producer.context);

        spans.push(consumer);
        spans.push(process);
        spans.push(producer);

        Ok(OutboundRecord {
            topic: self.settings.destination_topic.clone(),
            key: transformed.key,
            value: transformed.value,
            headers,
        })
    }

    /// Fail when shutdown was requested or a batch partition was revoked.
    fn check_interrupted(&mut self, offsets: &BatchOffsets) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Shutdown);
        }

        let mut hit = Vec::new();
        for (topic, partition) in self.source.take_revoked() {
            self.offsets.forget(&topic, partition);
            if offsets.touches(&topic, partition) {
                hit.push((topic, partition));
            }
        }

        if hit.is_empty() {
            Ok(())
        } else {
            Err(TransactionError::PartitionRevoked { partitions: hit }.into())
        }
    }

    /// Abort (when a handle is still open), drop the spans and rewind.
    async fn roll_back(
        &mut self,
        handle: Option<TransactionHandle>,
        cause: Error,
        offsets: &BatchOffsets,
        spans: BatchSpans,
    ) -> Result<IterationOutcome> {
        self.set_state(RelayState::Aborting);
        let discarded = spans.discard();

        if let Some(handle) = handle {
            if cause.is_fencing() {
                // The identity is gone; the broker resolves the transaction
                drop(handle);
            } else if let Err(abort_err) = self.sink.abort(handle).await {
                warn!(error = %abort_err, cause = %cause, "Abort failed");
                if abort_err.is_fatal() {
                    self.set_state(RelayState::Idle);
                    return self.handle_failure(abort_err);
                }
            }
        }

        // Without the rewind the next commit would skip the aborted records
        self.source.rewind(&offsets.rewind_marks()).await?;

        self.stats.batches_aborted += 1;
        debug!(spans = discarded, cause = %cause, "Batch rolled back");
        self.set_state(RelayState::Idle);
        self.handle_failure(cause)
    }

    /// Classify an iteration failure: keep going or stop.
    fn handle_failure(&mut self, cause: Error) -> Result<IterationOutcome> {
        let reason = match &cause {
            Error::Shutdown => {
                info!("Batch aborted for shutdown");
                return Ok(IterationOutcome::Aborted {
                    reason: TransactionError::Aborted,
                });
            }
            Error::Transaction(e) => e.clone(),
            Error::Kafka(e) => TransactionError::TransientBroker(e.to_string()),
            other => TransactionError::TransientBroker(other.to_string()),
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_error(reason.kind());
        }

        if cause.is_fencing() {
            self.record_fencing();
            self.mark_unhealthy(COMPONENT_SINK, &cause.to_string());
            error!(error = %cause, "Transactional identity fenced");
            return Err(cause);
        }

        if !cause.is_retryable() {
            self.mark_unhealthy(COMPONENT_RELAY, &cause.to_string());
            error!(error = %cause, "Fatal relay error");
            return Err(cause);
        }

        self.consecutive_failures += 1;
        if let Some(metrics) = &self.metrics {
            metrics.record_abort(reason.kind());
        }

        if self.consecutive_failures >= self.settings.retry.max_retries {
            let exhausted = TransactionError::RetriesExhausted {
                attempts: self.consecutive_failures,
                last_error: cause.to_string(),
            };
            self.mark_unhealthy(COMPONENT_RELAY, &exhausted.to_string());
            error!(error = %exhausted, "Giving up");
            return Err(exhausted.into());
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_retry();
        }
        self.mark_degraded(COMPONENT_RELAY, &cause.to_string());
        warn!(
            error = %cause,
            kind = reason.kind(),
            attempt = self.consecutive_failures,
            max_retries = self.settings.retry.max_retries,
            "Batch aborted, will retry"
        );

        Ok(IterationOutcome::Aborted { reason })
    }

    fn is_cancelled(&mut self) -> bool {
        if !self.cancelled {
            if let Some(shutdown) = self.shutdown.as_mut() {
                if !matches!(
                    shutdown.try_recv(),
                    Err(broadcast::error::TryRecvError::Empty)
                ) {
                    self.cancelled = true;
                }
            }
        }
        self.cancelled
    }

    async fn sleep_unless_cancelled(&mut self, delay: Duration) {
        match self.shutdown.as_mut() {
            Some(shutdown) => {
                let woke_for_shutdown = tokio::select! {
                    _ = tokio::time::sleep(delay) => false,
                    _ = shutdown.recv() => true,
                };
                if woke_for_shutdown {
                    self.cancelled = true;
                }
            }
            None => tokio::time::sleep(delay).await,
        }
    }

    fn set_state(&self, state: RelayState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Relay state");
        }
    }

    fn record_fencing(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_fencing();
        }
    }

    fn mark_healthy(&self, component: &str) {
        if let Some(health) = &self.health {
            health.mark_healthy(component);
        }
    }

    fn mark_degraded(&self, component: &str, reason: &str) {
        if let Some(health) = &self.health {
            health.mark_degraded(component, reason);
        }
    }

    fn mark_unhealthy(&self, component: &str, reason: &str) {
        if let Some(health) = &self.health {
            health.mark_unhealthy(component, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{FaultAction, FaultPoint, MemoryBroker, MemorySink, MemorySource};
    use crate::span::InMemorySpanExporter;
    use crate::transform::{TransformError, Transformed};

    fn settings() -> RelaySettings {
        RelaySettings {
            poll_timeout: Duration::from_millis(20),
            retry: RetryConfig::new(Duration::from_millis(1), Duration::from_millis(5), 3)
                .without_jitter(),
            ..RelaySettings::new("out")
        }
    }

    fn relay(
        broker: &MemoryBroker,
        exporter: &InMemorySpanExporter,
    ) -> Relay<MemorySource, MemorySink> {
        Relay::builder(broker.source("g", "in", 10), broker.sink("t"), settings())
            .exporter(Arc::new(exporter.clone()))
            .build()
    }

    #[tokio::test]
    async fn test_empty_poll_is_idle() {
        let broker = MemoryBroker::new();
        let exporter = InMemorySpanExporter::new();
        let mut relay = relay(&broker, &exporter);

        assert_eq!(relay.run_once().await.unwrap(), IterationOutcome::Idle);
        assert_eq!(relay.state(), RelayState::Idle);
        assert!(exporter.spans().is_empty());
    }

    #[tokio::test]
    async fn test_commit_exports_three_spans_per_record() {
        let broker = MemoryBroker::new();
        broker.produce("in", 0, None, b"a", vec![]);
        broker.produce("in", 0, None, b"b", vec![]);
        let exporter = InMemorySpanExporter::new();
        let mut relay = relay(&broker, &exporter);

        assert_eq!(
            relay.run_once().await.unwrap(),
            IterationOutcome::Committed { records: 2 }
        );
        assert_eq!(exporter.spans().len(), 6);
        assert_eq!(broker.committed_offset("g", "in", 0), Some(2));
        assert_eq!(relay.offsets().get_committed("in", 0), Some(2));
        assert_eq!(relay.stats().records_relayed, 2);
    }

    #[tokio::test]
    async fn test_transform_failure_aborts_whole_batch() {
        let broker = MemoryBroker::new();
        broker.produce("in", 0, None, b"ok", vec![]);
        broker.produce("in", 0, None, b"bad", vec![]);
        let exporter = InMemorySpanExporter::new();

        let reject_bad = |r: &Record| -> std::result::Result<Transformed, TransformError> {
            if r.value == b"bad" {
                Err(TransformError("unparseable".into()))
            } else {
                Ok(Transformed {
                    key: None,
                    value: r.value.clone(),
                })
            }
        };
        let mut relay = Relay::builder(broker.source("g", "in", 10), broker.sink("t"), settings())
            .exporter(Arc::new(exporter.clone()))
            .transform(Arc::new(reject_bad))
            .build();

        let outcome = relay.run_once().await.unwrap();
        assert!(matches!(
            outcome,
            IterationOutcome::Aborted {
                reason: TransactionError::Serialization { offset: 1, .. }
            }
        ));
        assert!(broker.read_committed("out").is_empty());
        assert!(exporter.spans().is_empty());
        assert_eq!(relay.source().position(0), 0);
        assert_eq!(relay.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_revocation_mid_transaction_aborts() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let broker = MemoryBroker::new();
        broker.produce("in", 0, None, b"a", vec![]);
        broker.produce("in", 0, None, b"b", vec![]);
        let exporter = InMemorySpanExporter::new();

        let source = broker.source("g", "in", 10);
        let revoker = source.revocation_handle();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_in_transform = Arc::clone(&fired);

        // Rebalance lands while the first record is being processed
        let revoke_once = move |r: &Record| -> std::result::Result<Transformed, TransformError> {
            if !fired_in_transform.swap(true, Ordering::SeqCst) {
                revoker.revoke("in", 0);
            }
            Ok(Transformed {
                key: None,
                value: r.value.clone(),
            })
        };
        let mut relay = Relay::builder(source, broker.sink("t"), settings())
            .exporter(Arc::new(exporter.clone()))
            .transform(Arc::new(revoke_once))
            .build();

        let outcome = relay.run_once().await.unwrap();
        assert_eq!(
            outcome,
            IterationOutcome::Aborted {
                reason: TransactionError::PartitionRevoked {
                    partitions: vec![("in".to_string(), 0)]
                }
            }
        );
        assert!(fired.load(Ordering::SeqCst));
        assert!(broker.read_committed("out").is_empty());
        assert!(exporter.spans().is_empty());

        assert_eq!(
            relay.run_once().await.unwrap(),
            IterationOutcome::Committed { records: 2 }
        );
        assert_eq!(broker.read_committed("out").len(), 2);
        assert_eq!(broker.committed_offset("g", "in", 0), Some(2));
    }

    #[tokio::test]
    async fn test_revocation_of_other_partition_is_ignored() {
        let broker = MemoryBroker::new();
        broker.create_topic("in", 2);
        broker.produce("in", 0, None, b"a", vec![]);
        let exporter = InMemorySpanExporter::new();
        let mut relay = relay(&broker, &exporter);
        relay.source().revocation_handle().revoke("in", 1);

        assert_eq!(
            relay.run_once().await.unwrap(),
            IterationOutcome::Committed { records: 1 }
        );
    }

    #[tokio::test]
    async fn test_fencing_is_fatal_and_not_retried() {
        let broker = MemoryBroker::new();
        broker.produce("in", 0, None, b"a", vec![]);
        broker.inject_fault(
            "t",
            FaultPoint::Begin,
            FaultAction::Fail(TransactionError::FencingLost {
                transactional_id: "t".into(),
                message: "epoch bumped".into(),
            }),
        );
        let exporter = InMemorySpanExporter::new();
        let metrics = Arc::new(RelayMetrics::new().unwrap());
        let health = Arc::new(HealthCheck::for_relay());
        let mut relay = Relay::builder(broker.source("g", "in", 10), broker.sink("t"), settings())
            .exporter(Arc::new(exporter.clone()))
            .metrics(Arc::clone(&metrics))
            .health(Arc::clone(&health))
            .build();

        let err = relay.run_once().await.unwrap_err();
        assert!(err.is_fencing());
        assert_eq!(metrics.fencing_events_total(), 1);
        assert!(!health.is_operational());
        assert_eq!(relay.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let broker = MemoryBroker::new();
        broker.produce("in", 0, None, b"a", vec![]);
        for _ in 0..3 {
            broker.inject_fault(
                "t",
                FaultPoint::Commit,
                FaultAction::Fail(TransactionError::TransientBroker("down".into())),
            );
        }
        let exporter = InMemorySpanExporter::new();
        let mut relay = relay(&broker, &exporter);

        for attempt in 1..3 {
            let outcome = relay.run_once().await.unwrap();
            assert!(matches!(outcome, IterationOutcome::Aborted { .. }));
            assert_eq!(relay.consecutive_failures(), attempt);
        }

        let err = relay.run_once().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Transaction(TransactionError::RetriesExhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_state_watch_ends_idle() {
        let broker = MemoryBroker::new();
        broker.produce("in", 0, None, b"a", vec![]);
        let exporter = InMemorySpanExporter::new();
        let mut relay = relay(&broker, &exporter);
        let mut states = relay.subscribe();

        relay.run_once().await.unwrap();
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), RelayState::Idle);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let broker = MemoryBroker::new();
        broker.produce("in", 0, None, b"a", vec![]);
        let exporter = InMemorySpanExporter::new();
        let mut relay = relay(&broker, &exporter);
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn(async move {
            let stats = relay.run(rx).await;
            (stats, relay.state())
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.read_committed("out").is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tx.send(()).unwrap();

        let (stats, state) = handle.await.unwrap();
        let stats = stats.unwrap();
        assert_eq!(stats.batches_committed, 1);
        assert_eq!(stats.records_relayed, 1);
        assert_eq!(state, RelayState::Stopped);
    }

    fn signal_on_first_record(
        tx: broadcast::Sender<()>,
    ) -> impl Fn(&Record) -> std::result::Result<Transformed, TransformError> + Send + Sync {
        move |r: &Record| {
            if r.offset == 0 {
                let _ = tx.send(());
            }
            Ok(Transformed {
                key: None,
                value: r.value.clone(),
            })
        }
    }

    #[tokio::test]
    async fn test_shutdown_mid_transaction_aborts_batch() {
        let broker = MemoryBroker::new();
        broker.produce("in", 0, None, b"a", vec![]);
        broker.produce("in", 0, None, b"b", vec![]);
        let exporter = InMemorySpanExporter::new();
        let (tx, rx) = broadcast::channel(1);

        let mut relay = Relay::builder(broker.source("g", "in", 10), broker.sink("t"), settings())
            .exporter(Arc::new(exporter.clone()))
            .transform(Arc::new(signal_on_first_record(tx)))
            .shutdown(rx)
            .build();

        assert_eq!(
            relay.run_once().await.unwrap(),
            IterationOutcome::Aborted {
                reason: TransactionError::Aborted
            }
        );
        assert!(broker.read_committed("out").is_empty());
        assert!(!broker.has_open_transaction("t"));
        assert_eq!(broker.committed_offset("g", "in", 0), None);
        assert!(exporter.spans().is_empty());
        assert_eq!(relay.source().position(0), 0);
        assert_eq!(relay.stats().batches_aborted, 1);
        // shutdown is not a failure
        assert_eq!(relay.consecutive_failures(), 0);

        // a cancelled relay does not poll again
        assert_eq!(relay.run_once().await.unwrap(), IterationOutcome::Idle);
        assert!(broker.read_committed("out").is_empty());
    }

    #[tokio::test]
    async fn test_run_aborts_open_transaction_on_shutdown() {
        let broker = MemoryBroker::new();
        broker.produce("in", 0, None, b"a", vec![]);
        broker.produce("in", 0, None, b"b", vec![]);
        let exporter = InMemorySpanExporter::new();
        let (tx, rx) = broadcast::channel(1);

        let mut relay = Relay::builder(broker.source("g", "in", 10), broker.sink("t"), settings())
            .exporter(Arc::new(exporter.clone()))
            .transform(Arc::new(signal_on_first_record(tx)))
            .build();

        let (stats, state) = tokio::time::timeout(Duration::from_secs(5), async {
            let stats = relay.run(rx).await;
            (stats, relay.state())
        })
        .await
        .unwrap();

        let stats = stats.unwrap();
        assert_eq!(stats.batches_committed, 0);
        assert_eq!(stats.batches_aborted, 1);
        assert_eq!(state, RelayState::Stopped);
        assert!(broker.read_committed("out").is_empty());
        assert!(!broker.has_open_transaction("t"));
        assert_eq!(broker.committed_offset("g", "in", 0), None);
        assert!(exporter.spans().is_empty());
    }

    #[tokio::test]
    async fn test_consumer_lag_counts_records_not_yet_relayed() {
        let broker = MemoryBroker::new();
        for i in 0..5 {
            broker.produce("in", 0, None, format!("v{}", i).as_bytes(), vec![]);
        }
        let exporter = InMemorySpanExporter::new();
        let metrics = Arc::new(RelayMetrics::new().unwrap());
        let mut relay = Relay::builder(broker.source("g", "in", 2), broker.sink("t"), settings())
            .exporter(Arc::new(exporter.clone()))
            .metrics(Arc::clone(&metrics))
            .build();

        for (records, lag) in [(2, 3), (2, 1), (1, 0)] {
            assert_eq!(
                relay.run_once().await.unwrap(),
                IterationOutcome::Committed { records }
            );
            assert_eq!(metrics.consumer_lag(), lag);
        }

        broker.produce("in", 0, None, b"late", vec![]);
        relay.run_once().await.unwrap();
        assert_eq!(metrics.consumer_lag(), 0);
        assert_eq!(relay.offsets().get_end("in", 0), Some(6));
    }

    #[test]
    fn test_settings_from_config() {
        let config = Config::from_toml(
            r#"
            [kafka]
            bootstrap_servers = ["kafka:9092"]
            source_topic = "orders"
            destination_topic = "orders-relayed"
            consumer_group = "g"
            transactional_id = "t"
            batch_timeout_ms = 250

            [relay]
            max_retries = 4
            service_name = "relay-a"
            "#,
        )
        .unwrap();

        let settings = RelaySettings::from_config(&config);
        assert_eq!(settings.destination_topic, "orders-relayed");
        assert_eq!(settings.poll_timeout, Duration::from_millis(250));
        assert_eq!(settings.retry.max_retries, 4);
        assert_eq!(settings.service_name, "relay-a");
    }
}
