//! Record source: a partitioned log consumer with manual offset advancement.
//!
//! The source never commits offsets itself. Consumption progress is only
//! made durable by the transactional sink, inside the same transaction as
//! the relayed records. Revoked partitions are surfaced to the relay so that
//! any in-flight transaction touching them is aborted instead of committed.
//!
//! ## Exponential Backoff
//!
//! `RetryConfig` computes the delay between failed relay iterations:
//! min(max_delay, base_delay * 2^attempt) + jitter

use crate::config::{KafkaConfig, OffsetReset, RelayConfig};
use crate::kafka::record::{OffsetMark, Record};
use crate::{Error, KafkaError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::consumer::{
    BaseConsumer, Consumer, ConsumerContext, ConsumerGroupMetadata, Rebalance, StreamConsumer,
};
use rdkafka::{ClientConfig, ClientContext, Offset};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for exponential backoff retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay for first retry (default: 100ms)
    pub base_delay: Duration,
    /// Maximum delay cap (default: 30s)
    pub max_delay: Duration,
    /// Maximum number of consecutive failed attempts (default: 10)
    pub max_retries: u32,
    /// Whether to add jitter (randomness) to delays (default: true)
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            max_retries: 10,
            jitter: true,
        }
    }
}

impl From<&RelayConfig> for RetryConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            max_retries: config.max_retries,
            jitter: config.retry_jitter,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with custom settings.
    pub fn new(base_delay: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_retries,
            jitter: true,
        }
    }

    /// Disable jitter (for testing).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Calculate the backoff delay for a given attempt.
    ///
    /// Uses exponential backoff: min(max_delay, base_delay * 2^attempt)
    /// Optionally adds jitter (±25%) to prevent thundering herd.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;

        let delay_ms = base_ms.saturating_mul(1u64 << attempt.min(20));
        let capped_delay_ms = delay_ms.min(max_ms);

        let final_delay_ms = if self.jitter {
            let jitter_range = capped_delay_ms / 4;
            let jitter = (std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos() as u64)
                % (jitter_range * 2 + 1);
            capped_delay_ms.saturating_sub(jitter_range) + jitter
        } else {
            capped_delay_ms
        };

        Duration::from_millis(final_delay_ms)
    }
}

/// Consumer-group identity passed to offset registration.
#[derive(Clone)]
pub struct ConsumerGroup {
    /// Group id from configuration
    pub group_id: String,
    /// Native group metadata (generation, member id) when backed by Kafka
    pub metadata: Option<Arc<ConsumerGroupMetadata>>,
}

impl ConsumerGroup {
    /// A group identified by id only.
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            metadata: None,
        }
    }
}

impl std::fmt::Debug for ConsumerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerGroup")
            .field("group_id", &self.group_id)
            .field("has_metadata", &self.metadata.is_some())
            .finish()
    }
}

/// A partitioned log consumer feeding the relay.
#[async_trait]
pub trait RecordSource: Send {
    /// Pull the next batch, waiting at most `timeout`.
    ///
    /// Returns an empty batch on timeout; "no data" is never an error. An
    /// error never discards consumed records: when one occurs after part of
    /// a batch was read, that part is returned and the error is reported by
    /// the next call.
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<Record>>;

    /// Offset one past the last record of a partition (the high watermark),
    /// `None` when unknown.
    fn end_offset(&self, topic: &str, partition: i32) -> Option<i64>;

    /// Whether offsets are only advanced through the transactional sink.
    fn commit_is_manual(&self) -> bool;

    /// Drain partitions revoked since the previous call.
    fn take_revoked(&mut self) -> Vec<(String, i32)>;

    /// Reposition so that the next poll starts at the given marks.
    ///
    /// Partitions no longer assigned to this consumer are skipped.
    async fn rewind(&mut self, positions: &[OffsetMark]) -> Result<()>;

    /// Consumer-group identity for offset registration.
    fn group(&self) -> Result<ConsumerGroup>;

    /// Leave the group and release resources.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Consumer context recording rebalance revocations.
pub struct RevocationContext {
    revoked: Arc<Mutex<BTreeSet<(String, i32)>>>,
}

impl ClientContext for RevocationContext {}

impl ConsumerContext for RevocationContext {
    fn pre_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                let mut revoked = self.revoked.lock();
                for element in tpl.elements() {
                    revoked.insert((element.topic().to_string(), element.partition()));
                }
                warn!(partitions = tpl.count(), "Partitions revoked");
            }
            Rebalance::Assign(tpl) => {
                debug!(partitions = tpl.count(), "Partitions being assigned");
            }
            Rebalance::Error(e) => {
                warn!(error = %e, "Rebalance error");
            }
        }
    }

    fn post_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(tpl) = rebalance {
            info!(partitions = tpl.count(), "Partitions assigned");
        }
    }
}

/// Builder for creating a Kafka record source.
pub struct KafkaSourceBuilder {
    config: KafkaConfig,
}

impl KafkaSourceBuilder {
    /// Create a new source builder.
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }

    /// Build the source and subscribe to the source topic.
    pub fn build(self) -> Result<KafkaRecordSource> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", self.config.bootstrap_servers.join(","))
            .set("group.id", &self.config.consumer_group)
            // Offsets advance only inside producer transactions
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            // Never observe records of aborted upstream transactions
            .set("isolation.level", "read_committed")
            .set(
                "auto.offset.reset",
                match self.config.auto_offset_reset {
                    OffsetReset::Earliest => "earliest",
                    OffsetReset::Latest => "latest",
                },
            )
            .set(
                "session.timeout.ms",
                self.config.session_timeout_ms.to_string(),
            )
            .set(
                "heartbeat.interval.ms",
                self.config.heartbeat_interval_ms.to_string(),
            )
            .set(
                "max.poll.interval.ms",
                self.config.max_poll_interval_ms.to_string(),
            )
            .set("partition.assignment.strategy", "cooperative-sticky");

        self.config.security.apply(&mut client_config);

        let revoked = Arc::new(Mutex::new(BTreeSet::new()));
        let context = RevocationContext {
            revoked: Arc::clone(&revoked),
        };

        let consumer: StreamConsumer<RevocationContext> = client_config
            .create_with_context(context)
            .map_err(|e| {
                Error::Kafka(KafkaError::ConnectionFailed {
                    broker: self.config.bootstrap_servers.join(","),
                    message: e.to_string(),
                })
            })?;

        consumer
            .subscribe(&[&self.config.source_topic])
            .map_err(|e| Error::Kafka(KafkaError::ConsumerGroup(e.to_string())))?;

        info!(
            topic = %self.config.source_topic,
            group = %self.config.consumer_group,
            servers = %self.config.bootstrap_servers.join(","),
            "Kafka source subscribed"
        );

        Ok(KafkaRecordSource {
            consumer,
            group_id: self.config.consumer_group,
            batch_size: self.config.batch_size,
            operation_timeout: Duration::from_millis(self.config.operation_timeout_ms),
            revoked,
            deferred_error: None,
        })
    }
}

/// Kafka-backed record source.
pub struct KafkaRecordSource {
    consumer: StreamConsumer<RevocationContext>,
    group_id: String,
    batch_size: usize,
    operation_timeout: Duration,
    revoked: Arc<Mutex<BTreeSet<(String, i32)>>>,
    deferred_error: Option<String>,
}

impl KafkaRecordSource {
    /// Get the current partition assignment.
    pub fn assignment(&self) -> Result<Vec<(String, i32)>> {
        let tpl = self
            .consumer
            .assignment()
            .map_err(|e| Error::Kafka(KafkaError::PartitionAssignment(e.to_string())))?;

        Ok(tpl
            .elements()
            .iter()
            .map(|e| (e.topic().to_string(), e.partition()))
            .collect())
    }
}

#[async_trait]
impl RecordSource for KafkaRecordSource {
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<Record>> {
        use futures::StreamExt;

        if let Some(message) = self.deferred_error.take() {
            return Err(Error::Kafka(KafkaError::Poll(message)));
        }

        let mut batch = Vec::with_capacity(self.batch_size);
        let deadline = tokio::time::Instant::now() + timeout;
        let stream = self.consumer.stream();
        tokio::pin!(stream);

        while batch.len() < self.batch_size {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, stream.next()).await {
                Ok(Some(Ok(msg))) => {
                    batch.push(Record::from_message(&msg));
                }
                Ok(Some(Err(e))) if batch.is_empty() => {
                    return Err(Error::Kafka(KafkaError::Poll(e.to_string())));
                }
                Ok(Some(Err(e))) => {
                    // The fetch position is already past the collected records
                    warn!(error = %e, records = batch.len(), "Poll error after partial batch");
                    self.deferred_error = Some(e.to_string());
                    break;
                }
                Ok(None) | Err(_) => break,
            }
        }

        Ok(batch)
    }

    fn end_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        match self
            .consumer
            .fetch_watermarks(topic, partition, self.operation_timeout)
        {
            Ok((_, high)) => Some(high),
            Err(e) => {
                debug!(topic, partition, error = %e, "Watermark fetch failed");
                None
            }
        }
    }

    fn commit_is_manual(&self) -> bool {
        true
    }

    fn take_revoked(&mut self) -> Vec<(String, i32)> {
        std::mem::take(&mut *self.revoked.lock())
            .into_iter()
            .collect()
    }

    async fn rewind(&mut self, positions: &[OffsetMark]) -> Result<()> {
        let assigned = self.assignment()?;

        for mark in positions {
            if !assigned
                .iter()
                .any(|(t, p)| t == &mark.topic && *p == mark.partition)
            {
                debug!(
                    topic = %mark.topic,
                    partition = mark.partition,
                    "Skipping rewind of unassigned partition"
                );
                continue;
            }

            self.consumer
                .seek(
                    &mark.topic,
                    mark.partition,
                    Offset::Offset(mark.next_offset),
                    self.operation_timeout,
                )
                .map_err(|e| Error::Kafka(KafkaError::PartitionAssignment(e.to_string())))?;

            debug!(
                topic = %mark.topic,
                partition = mark.partition,
                offset = mark.next_offset,
                "Source rewound"
            );
        }

        Ok(())
    }

    fn group(&self) -> Result<ConsumerGroup> {
        let metadata = self.consumer.group_metadata().ok_or_else(|| {
            Error::Kafka(KafkaError::ConsumerGroup(
                "consumer group metadata unavailable".into(),
            ))
        })?;

        Ok(ConsumerGroup {
            group_id: self.group_id.clone(),
            metadata: Some(Arc::new(metadata)),
        })
    }

    async fn close(&mut self) -> Result<()> {
        self.consumer.unsubscribe();
        info!(group = %self.group_id, "Kafka source closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.base_delay, Duration::from_millis(100));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.max_retries, 10);
        assert!(config.jitter);
    }

    #[test]
    fn test_retry_config_from_relay_config() {
        let relay = RelayConfig {
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 2_000,
            max_retries: 4,
            retry_jitter: false,
            ..RelayConfig::default()
        };
        let config = RetryConfig::from(&relay);
        assert_eq!(config.base_delay, Duration::from_millis(50));
        assert_eq!(config.max_delay, Duration::from_secs(2));
        assert_eq!(config.max_retries, 4);
        assert!(!config.jitter);
    }

    #[test]
    fn test_calculate_delay_exponential() {
        let config = RetryConfig::new(Duration::from_millis(100), Duration::from_secs(30), 10)
            .without_jitter();

        assert_eq!(config.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(config.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(config.calculate_delay(2), Duration::from_millis(400));
        assert_eq!(config.calculate_delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_calculate_delay_caps_at_max() {
        let config = RetryConfig::new(Duration::from_millis(100), Duration::from_secs(1), 10)
            .without_jitter();

        assert_eq!(config.calculate_delay(10), Duration::from_millis(1000));
        assert_eq!(config.calculate_delay(50), Duration::from_millis(1000));
    }

    #[test]
    fn test_calculate_delay_with_jitter() {
        let config = RetryConfig::new(Duration::from_millis(1000), Duration::from_secs(30), 10);

        let delay = config.calculate_delay(0);
        assert!(delay >= Duration::from_millis(750), "delay {:?}", delay);
        assert!(delay <= Duration::from_millis(1250), "delay {:?}", delay);
    }

    #[test]
    fn test_consumer_group_debug_hides_native_handle() {
        let group = ConsumerGroup::new("relay-group");
        let rendered = format!("{:?}", group);
        assert!(rendered.contains("relay-group"));
        assert!(rendered.contains("has_metadata: false"));
    }
}
