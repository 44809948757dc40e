//! Transactional sink: produce records and advance consumer offsets as one
//! atomic unit.
//!
//! Lifecycle of a transaction:
//! `begin -> enqueue* -> register_offsets -> commit | abort`
//!
//! A sink holds at most one open transaction. Handles are moved into
//! `commit`/`abort`, so a finished handle cannot be used again, and a handle
//! minted by another sink instance is rejected.

use crate::config::KafkaConfig;
use crate::kafka::record::{owned_headers, Headers, OffsetMark};
use crate::kafka::source::ConsumerGroup;
use crate::{Error, KafkaError, Result, TransactionError};
use async_trait::async_trait;
use rdkafka::error::KafkaResult;
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

static NEXT_SINK_ID: AtomicU64 = AtomicU64::new(1);

/// Offset marks keyed by (topic, partition).
pub type OffsetMarks = BTreeMap<(String, i32), OffsetMark>;

/// Opaque handle for one open transaction.
#[derive(Debug, PartialEq, Eq)]
pub struct TransactionHandle {
    sink_id: u64,
    txn_id: u64,
}

impl TransactionHandle {
    /// Sequence number of this transaction within its sink.
    pub fn id(&self) -> u64 {
        self.txn_id
    }
}

/// Bookkeeping shared by sink implementations: one open transaction at a
/// time, handles bound to the sink that issued them.
#[derive(Debug)]
pub struct TransactionSlot {
    sink_id: u64,
    next_txn: u64,
    open: Option<u64>,
}

impl TransactionSlot {
    /// Create a slot with a process-unique sink id.
    pub fn new() -> Self {
        Self {
            sink_id: NEXT_SINK_ID.fetch_add(1, Ordering::Relaxed),
            next_txn: 1,
            open: None,
        }
    }

    /// Open a new transaction.
    pub fn open(&mut self) -> std::result::Result<TransactionHandle, TransactionError> {
        if let Some(txn) = self.open {
            return Err(TransactionError::TransactionState(format!(
                "transaction {} is still open",
                txn
            )));
        }

        let txn_id = self.next_txn;
        self.next_txn += 1;
        self.open = Some(txn_id);

        Ok(TransactionHandle {
            sink_id: self.sink_id,
            txn_id,
        })
    }

    /// Verify that `handle` is the open transaction of this sink.
    pub fn check(&self, handle: &TransactionHandle) -> std::result::Result<(), TransactionError> {
        if handle.sink_id != self.sink_id {
            return Err(TransactionError::TransactionState(
                "handle belongs to a different sink".into(),
            ));
        }

        match self.open {
            Some(txn) if txn == handle.txn_id => Ok(()),
            Some(txn) => Err(TransactionError::TransactionState(format!(
                "handle {} is stale, transaction {} is open",
                handle.txn_id, txn
            ))),
            None => Err(TransactionError::TransactionState(format!(
                "handle {} has no open transaction",
                handle.txn_id
            ))),
        }
    }

    /// Resolve the open transaction.
    pub fn close(&mut self, handle: &TransactionHandle) -> std::result::Result<(), TransactionError> {
        self.check(handle)?;
        self.open = None;
        Ok(())
    }

    /// Whether a transaction is open.
    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }
}

impl Default for TransactionSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// A record to be produced inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRecord {
    /// Destination topic
    pub topic: String,
    /// Record key
    pub key: Option<Vec<u8>>,
    /// Payload
    pub value: Vec<u8>,
    /// Headers including the injected causality token
    pub headers: Headers,
}

/// Where a committed record landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Destination topic
    pub topic: String,
    /// Destination partition
    pub partition: i32,
    /// Destination offset
    pub offset: i64,
}

/// Resolves a `PendingAck` once the transaction outcome is known.
#[derive(Debug)]
pub struct AckResolver {
    tx: oneshot::Sender<std::result::Result<Ack, TransactionError>>,
}

impl AckResolver {
    /// Deliver the outcome. The receiver may already be gone.
    pub fn resolve(self, outcome: std::result::Result<Ack, TransactionError>) {
        let _ = self.tx.send(outcome);
    }
}

/// Acknowledgment of an enqueued record.
///
/// Resolves only after the surrounding transaction commits; resolves to
/// `TransactionError::Aborted` when it aborts or the sink is dropped.
#[derive(Debug)]
pub struct PendingAck {
    rx: oneshot::Receiver<std::result::Result<Ack, TransactionError>>,
}

impl PendingAck {
    /// Create a linked resolver/ack pair.
    pub fn channel() -> (AckResolver, PendingAck) {
        let (tx, rx) = oneshot::channel();
        (AckResolver { tx }, PendingAck { rx })
    }
}

impl Future for PendingAck {
    type Output = std::result::Result<Ack, TransactionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(TransactionError::Aborted)))
    }
}

/// A transactional log producer.
#[async_trait]
pub trait TransactionalSink: Send {
    /// Register the transactional identity with the broker.
    async fn init(&mut self) -> Result<()>;

    /// Start a transaction. Fails with `FencingLost` when another live
    /// session holds the identity and with `TransactionState` when a
    /// transaction is already open on this sink.
    async fn begin(&mut self) -> Result<TransactionHandle>;

    /// Enqueue a record without waiting for it.
    async fn enqueue(
        &mut self,
        handle: &TransactionHandle,
        record: OutboundRecord,
    ) -> Result<PendingAck>;

    /// Attach consumer offset advancement to the transaction.
    async fn register_offsets(
        &mut self,
        handle: &TransactionHandle,
        marks: &OffsetMarks,
        group: &ConsumerGroup,
    ) -> Result<()>;

    /// Atomically apply enqueued records and registered offsets.
    ///
    /// On failure the transaction is aborted before returning and every
    /// pending ack resolves to `Aborted`.
    async fn commit(&mut self, handle: TransactionHandle) -> Result<()>;

    /// Discard enqueued records and registered offsets.
    async fn abort(&mut self, handle: TransactionHandle) -> Result<()>;

    /// The transactional identity this sink produces under.
    fn transactional_id(&self) -> &str;

    /// Release the transactional identity.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Kafka transactional producer.
pub struct KafkaTransactionalSink {
    producer: FutureProducer,
    transactional_id: String,
    operation_timeout: Duration,
    slot: TransactionSlot,
    in_flight: Vec<(String, DeliveryFuture, AckResolver)>,
}

impl KafkaTransactionalSink {
    /// Create the producer. Call `init` before the first `begin`.
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", config.bootstrap_servers.join(","))
            .set("transactional.id", &config.transactional_id)
            .set("enable.idempotence", "true")
            .set(
                "transaction.timeout.ms",
                config.transaction_timeout_ms.to_string(),
            )
            .set("message.timeout.ms", config.transaction_timeout_ms.to_string());

        config.security.apply(&mut client_config);

        let producer: FutureProducer = client_config.create().map_err(|e| {
            Error::Kafka(KafkaError::ConnectionFailed {
                broker: config.bootstrap_servers.join(","),
                message: e.to_string(),
            })
        })?;

        Ok(Self {
            producer,
            transactional_id: config.transactional_id.clone(),
            operation_timeout: Duration::from_millis(config.operation_timeout_ms),
            slot: TransactionSlot::new(),
            in_flight: Vec::new(),
        })
    }

    /// Run a blocking transactional producer call off the async runtime.
    async fn blocking<F>(&self, op: &'static str, f: F) -> std::result::Result<(), TransactionError>
    where
        F: FnOnce(&FutureProducer, Duration) -> KafkaResult<()> + Send + 'static,
    {
        let producer = self.producer.clone();
        let timeout = self.operation_timeout;

        tokio::task::spawn_blocking(move || f(&producer, timeout))
            .await
            .map_err(|e| TransactionError::TransientBroker(format!("{} task failed: {}", op, e)))?
            .map_err(|e| TransactionError::from_producer_error(&e, &self.transactional_id))
    }

    fn resolve_all(&mut self, outcome: TransactionError) {
        for (_, _, resolver) in self.in_flight.drain(..) {
            resolver.resolve(Err(outcome.clone()));
        }
    }
}

#[async_trait]
impl TransactionalSink for KafkaTransactionalSink {
    async fn init(&mut self) -> Result<()> {
        self.blocking("init_transactions", |p, t| p.init_transactions(t))
            .await?;

        info!(
            transactional_id = %self.transactional_id,
            "Transactional producer initialized"
        );
        Ok(())
    }

    async fn begin(&mut self) -> Result<TransactionHandle> {
        let handle = self.slot.open()?;

        if let Err(e) = self.producer.begin_transaction() {
            self.slot.close(&handle)?;
            return Err(TransactionError::from_producer_error(&e, &self.transactional_id).into());
        }

        debug!(txn = handle.id(), "Transaction started");
        Ok(handle)
    }

    async fn enqueue(
        &mut self,
        handle: &TransactionHandle,
        record: OutboundRecord,
    ) -> Result<PendingAck> {
        self.slot.check(handle)?;

        let mut future_record = FutureRecord::<[u8], [u8]>::to(&record.topic)
            .payload(record.value.as_slice())
            .headers(owned_headers(&record.headers));
        if let Some(key) = record.key.as_deref() {
            future_record = future_record.key(key);
        }

        let delivery = self
            .producer
            .send_result(future_record)
            .map_err(|(e, _)| TransactionError::from_producer_error(&e, &self.transactional_id))?;

        let (resolver, ack) = PendingAck::channel();
        self.in_flight.push((record.topic, delivery, resolver));
        Ok(ack)
    }

    async fn register_offsets(
        &mut self,
        handle: &TransactionHandle,
        marks: &OffsetMarks,
        group: &ConsumerGroup,
    ) -> Result<()> {
        self.slot.check(handle)?;

        let metadata = group.metadata.clone().ok_or_else(|| {
            TransactionError::TransactionState(format!(
                "no consumer group metadata for group {}",
                group.group_id
            ))
        })?;

        let mut tpl = TopicPartitionList::new();
        for mark in marks.values() {
            tpl.add_partition_offset(&mark.topic, mark.partition, Offset::Offset(mark.next_offset))
                .map_err(|e| TransactionError::TransactionState(e.to_string()))?;
        }

        self.blocking("send_offsets_to_transaction", move |p, t| {
            p.send_offsets_to_transaction(&tpl, &metadata, t)
        })
        .await?;

        debug!(
            txn = handle.id(),
            partitions = marks.len(),
            group = %group.group_id,
            "Offsets registered with transaction"
        );
        Ok(())
    }

    async fn commit(&mut self, handle: TransactionHandle) -> Result<()> {
        self.slot.close(&handle)?;

        if let Err(e) = self
            .blocking("commit_transaction", |p, t| p.commit_transaction(t))
            .await
        {
            warn!(txn = handle.id(), error = %e, "Transaction commit failed");
            self.resolve_all(TransactionError::Aborted);

            // The handle is gone; leave the producer ready for the next begin
            if !matches!(e, TransactionError::FencingLost { .. }) {
                if let Err(abort_err) = self
                    .blocking("abort_transaction", |p, t| p.abort_transaction(t))
                    .await
                {
                    warn!(txn = handle.id(), error = %abort_err, "Abort after failed commit failed");
                    return Err(abort_err.into());
                }
            }
            return Err(e.into());
        }

        for (topic, delivery, resolver) in self.in_flight.drain(..) {
            let outcome = match delivery.await {
                Ok(Ok((partition, offset))) => Ok(Ack {
                    topic,
                    partition,
                    offset,
                }),
                Ok(Err((e, _))) => Err(TransactionError::TransientBroker(e.to_string())),
                Err(_) => Err(TransactionError::Aborted),
            };
            resolver.resolve(outcome);
        }

        debug!(txn = handle.id(), "Transaction committed");
        Ok(())
    }

    async fn abort(&mut self, handle: TransactionHandle) -> Result<()> {
        self.slot.close(&handle)?;
        self.resolve_all(TransactionError::Aborted);

        self.blocking("abort_transaction", |p, t| p.abort_transaction(t))
            .await?;

        debug!(txn = handle.id(), "Transaction aborted");
        Ok(())
    }

    fn transactional_id(&self) -> &str {
        &self.transactional_id
    }

    async fn close(&mut self) -> Result<()> {
        if self.slot.is_open() {
            warn!("Closing sink with an open transaction; broker will abort it");
        }
        self.resolve_all(TransactionError::Aborted);
        info!(transactional_id = %self.transactional_id, "Transactional producer closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_rejects_second_open() {
        let mut slot = TransactionSlot::new();
        let handle = slot.open().unwrap();
        assert!(matches!(
            slot.open(),
            Err(TransactionError::TransactionState(_))
        ));
        slot.close(&handle).unwrap();
        assert!(slot.open().is_ok());
    }

    #[test]
    fn test_slot_rejects_stale_and_foreign_handles() {
        let mut slot = TransactionSlot::new();
        let first = slot.open().unwrap();
        slot.close(&first).unwrap();
        let _second = slot.open().unwrap();

        assert!(matches!(
            slot.check(&first),
            Err(TransactionError::TransactionState(_))
        ));

        let mut other = TransactionSlot::new();
        let foreign = other.open().unwrap();
        assert!(matches!(
            slot.check(&foreign),
            Err(TransactionError::TransactionState(_))
        ));
    }

    #[test]
    fn test_handle_ids_increase() {
        let mut slot = TransactionSlot::new();
        let a = slot.open().unwrap();
        slot.close(&a).unwrap();
        let b = slot.open().unwrap();
        assert!(b.id() > a.id());
    }

    #[tokio::test]
    async fn test_pending_ack_resolves_with_outcome() {
        let (resolver, ack) = PendingAck::channel();
        resolver.resolve(Ok(Ack {
            topic: "out".into(),
            partition: 0,
            offset: 7,
        }));
        assert_eq!(ack.await.unwrap().offset, 7);
    }

    #[tokio::test]
    async fn test_pending_ack_dropped_resolver_is_abort() {
        let (resolver, ack) = PendingAck::channel();
        drop(resolver);
        assert_eq!(ack.await, Err(TransactionError::Aborted));
    }
}
