//! In-process partitioned log with transactions and consumer groups.
//!
//! `MemoryBroker` implements the broker semantics the relay depends on:
//! transactional appends that stay invisible to read-committed readers until
//! commit, consumer-group offsets committed atomically with those appends,
//! transactional identity leases, and fault injection at every sink step.
//! `MemorySource` and `MemorySink` are the `RecordSource` and
//! `TransactionalSink` implementations backed by it.
//!
//! A crash is simulated with `FaultAction::CrashBefore`/`CrashAfter`: the
//! operation never returns, the caller drops the future and the sink, and
//! the next session that initializes the same transactional identity aborts
//! the dangling transaction.

use crate::kafka::{
    Ack, AckResolver, ConsumerGroup, Headers, OffsetMark, OffsetMarks, OutboundRecord,
    PendingAck, Record, RecordSource, TransactionHandle, TransactionSlot, TransactionalSink,
};
use crate::{Error, KafkaError, Result, TransactionError};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Sink step a fault is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// `TransactionalSink::begin`
    Begin,
    /// `TransactionalSink::enqueue`
    Enqueue,
    /// `TransactionalSink::register_offsets`
    RegisterOffsets,
    /// `TransactionalSink::commit`
    Commit,
    /// `TransactionalSink::abort`
    Abort,
}

/// What happens when a fault fires.
#[derive(Debug, Clone, PartialEq)]
pub enum FaultAction {
    /// Return the error without applying the step
    Fail(TransactionError),
    /// Never return, without applying the step
    CrashBefore,
    /// Apply the step, then never return
    CrashAfter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visibility {
    Committed,
    Pending,
    Aborted,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    record: Record,
    visibility: Visibility,
}

#[derive(Debug, Default)]
struct OpenTransaction {
    transactional_id: String,
    appended: Vec<(String, i32, i64)>,
    offsets: Vec<(String, OffsetMark)>,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    group_offsets: HashMap<(String, String, i32), i64>,
    leases: HashMap<String, u64>,
    live_sessions: HashSet<u64>,
    open: HashMap<u64, OpenTransaction>,
    faults: HashMap<(String, FaultPoint), VecDeque<FaultAction>>,
    next_session: u64,
    round_robin: u64,
}

impl BrokerState {
    fn partitions_mut(&mut self, topic: &str) -> &mut Vec<Vec<StoredRecord>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new()])
    }

    fn choose_partition(&mut self, topic: &str, key: Option<&[u8]>) -> i32 {
        let count = self.partitions_mut(topic).len().max(1) as u64;
        let slot = match key {
            // FNV-1a, stable across runs
            Some(key) => key.iter().fold(0xcbf2_9ce4_8422_2325u64, |hash, b| {
                (hash ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3)
            }),
            None => {
                self.round_robin += 1;
                self.round_robin
            }
        };
        (slot % count) as i32
    }

    fn append(
        &mut self,
        topic: &str,
        partition: i32,
        key: Option<Vec<u8>>,
        value: Vec<u8>,
        headers: Headers,
        visibility: Visibility,
    ) -> i64 {
        let partitions = self.partitions_mut(topic);
        let index = (partition.max(0) as usize).min(partitions.len() - 1);
        let log = &mut partitions[index];
        let offset = log.len() as i64;
        log.push(StoredRecord {
            record: Record {
                topic: topic.to_string(),
                partition: index as i32,
                offset,
                key,
                value,
                headers,
                timestamp: Utc::now(),
            },
            visibility,
        });
        offset
    }

    fn resolve(&mut self, session: u64, commit: bool) -> Option<OpenTransaction> {
        let txn = self.open.remove(&session)?;
        let visibility = if commit {
            Visibility::Committed
        } else {
            Visibility::Aborted
        };

        for (topic, partition, offset) in &txn.appended {
            if let Some(stored) = self
                .topics
                .get_mut(topic)
                .and_then(|p| p.get_mut(*partition as usize))
                .and_then(|log| log.get_mut(*offset as usize))
            {
                stored.visibility = visibility;
            }
        }

        if commit {
            for (group, mark) in &txn.offsets {
                self.group_offsets.insert(
                    (group.clone(), mark.topic.clone(), mark.partition),
                    mark.next_offset,
                );
            }
        }

        Some(txn)
    }

    fn take_fault(&mut self, transactional_id: &str, point: FaultPoint) -> Option<FaultAction> {
        let key = (transactional_id.to_string(), point);
        let queue = self.faults.get_mut(&key)?;
        let action = queue.pop_front();
        if queue.is_empty() {
            self.faults.remove(&key);
        }
        action
    }

    fn end_session(&mut self, session: u64) {
        self.live_sessions.remove(&session);
        self.leases.retain(|_, holder| *holder != session);
    }
}

/// Shared in-process broker. Clones refer to the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    appended: Arc<Notify>,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a topic with a number of partitions (at least one).
    pub fn create_topic(&self, topic: &str, partitions: usize) {
        let mut state = self.state.lock();
        let logs = state.partitions_mut(topic);
        logs.resize_with(partitions.max(1).max(logs.len()), Vec::new);
    }

    /// Append a committed record outside any transaction; returns its offset.
    pub fn produce(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&[u8]>,
        value: &[u8],
        headers: Headers,
    ) -> i64 {
        let offset = self.state.lock().append(
            topic,
            partition,
            key.map(<[u8]>::to_vec),
            value.to_vec(),
            headers,
            Visibility::Committed,
        );
        self.appended.notify_waiters();
        offset
    }

    /// Committed records of one partition in offset order.
    pub fn read_committed_partition(&self, topic: &str, partition: i32) -> Vec<Record> {
        let state = self.state.lock();
        state
            .topics
            .get(topic)
            .and_then(|p| p.get(partition as usize))
            .map(|log| {
                log.iter()
                    .filter(|s| s.visibility == Visibility::Committed)
                    .map(|s| s.record.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Committed records of all partitions, partition by partition.
    pub fn read_committed(&self, topic: &str) -> Vec<Record> {
        (0..self.partition_count(topic) as i32)
            .flat_map(|p| self.read_committed_partition(topic, p))
            .collect()
    }

    /// Every appended record regardless of transaction outcome.
    pub fn read_uncommitted(&self, topic: &str) -> Vec<Record> {
        let state = self.state.lock();
        state
            .topics
            .get(topic)
            .map(|partitions| {
                partitions
                    .iter()
                    .flat_map(|log| log.iter().map(|s| s.record.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of partitions of a topic (0 if unknown).
    pub fn partition_count(&self, topic: &str) -> usize {
        self.state.lock().topics.get(topic).map_or(0, Vec::len)
    }

    /// Committed next-offset of a consumer group on one partition.
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state
            .lock()
            .group_offsets
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Move a consumer group's committed position, outside any transaction.
    pub fn reset_group_offset(&self, group: &str, topic: &str, partition: i32, next_offset: i64) {
        self.state.lock().group_offsets.insert(
            (group.to_string(), topic.to_string(), partition),
            next_offset,
        );
    }

    /// Whether any transaction under the identity is open.
    pub fn has_open_transaction(&self, transactional_id: &str) -> bool {
        self.state
            .lock()
            .open
            .values()
            .any(|txn| txn.transactional_id == transactional_id)
    }

    /// Queue a one-shot fault for the next matching step of an identity.
    pub fn inject_fault(&self, transactional_id: &str, point: FaultPoint, action: FaultAction) {
        self.state
            .lock()
            .faults
            .entry((transactional_id.to_string(), point))
            .or_default()
            .push_back(action);
    }

    /// Create a consumer in `group` reading every partition of `topic`.
    pub fn source(&self, group: &str, topic: &str, batch_size: usize) -> MemorySource {
        self.create_topic(topic, 1);
        MemorySource {
            broker: self.clone(),
            group_id: group.to_string(),
            topic: topic.to_string(),
            batch_size: batch_size.max(1),
            positions: BTreeMap::new(),
            revoked: Arc::new(Mutex::new(BTreeSet::new())),
            poll_faults: VecDeque::new(),
            deferred_error: None,
        }
    }

    /// Create a producer session for a transactional identity.
    pub fn sink(&self, transactional_id: &str) -> MemorySink {
        let session = {
            let mut state = self.state.lock();
            state.next_session += 1;
            let session = state.next_session;
            state.live_sessions.insert(session);
            session
        };

        MemorySink {
            broker: self.clone(),
            transactional_id: transactional_id.to_string(),
            session,
            slot: TransactionSlot::new(),
            acks: Vec::new(),
        }
    }

    /// Offset the next append to a partition will get, pending and aborted
    /// records included.
    pub fn end_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        self.state
            .lock()
            .topics
            .get(topic)
            .and_then(|p| p.get(usize::try_from(partition).ok()?))
            .map(|log| log.len() as i64)
    }

    fn position(&self, group: &str, topic: &str, partition: i32) -> i64 {
        self.committed_offset(group, topic, partition).unwrap_or(0)
    }
}

/// Signals a partition revocation to a `MemorySource`.
#[derive(Clone)]
pub struct RevocationHandle {
    revoked: Arc<Mutex<BTreeSet<(String, i32)>>>,
}

impl RevocationHandle {
    /// Revoke a partition; it is reassigned on the next `take_revoked`.
    pub fn revoke(&self, topic: &str, partition: i32) {
        self.revoked.lock().insert((topic.to_string(), partition));
    }
}

/// Read-committed consumer over a `MemoryBroker` topic.
pub struct MemorySource {
    broker: MemoryBroker,
    group_id: String,
    topic: String,
    batch_size: usize,
    positions: BTreeMap<i32, i64>,
    revoked: Arc<Mutex<BTreeSet<(String, i32)>>>,
    poll_faults: VecDeque<(usize, String)>,
    deferred_error: Option<String>,
}

impl MemorySource {
    /// Fail a future poll once `after` records of its batch have been read.
    ///
    /// Faults fire one per non-empty fetch, in the order they were queued.
    pub fn inject_poll_error(&mut self, after: usize, message: impl Into<String>) {
        self.poll_faults.push_back((after, message.into()));
    }

    /// Handle for triggering revocations from outside the relay.
    pub fn revocation_handle(&self) -> RevocationHandle {
        RevocationHandle {
            revoked: Arc::clone(&self.revoked),
        }
    }

    /// Next offset this consumer will read from a partition.
    pub fn position(&self, partition: i32) -> i64 {
        self.positions.get(&partition).copied().unwrap_or_else(|| {
            self.broker
                .position(&self.group_id, &self.topic, partition)
        })
    }

    fn fetch(&mut self) -> Vec<Record> {
        let mut batch = Vec::new();
        let state = self.broker.state.lock();
        let Some(partitions) = state.topics.get(&self.topic) else {
            return batch;
        };

        for (index, log) in partitions.iter().enumerate() {
            let partition = index as i32;
            let mut position = self.positions.get(&partition).copied().unwrap_or_else(|| {
                state
                    .group_offsets
                    .get(&(self.group_id.clone(), self.topic.clone(), partition))
                    .copied()
                    .unwrap_or(0)
            });

            while batch.len() < self.batch_size {
                let Some(stored) = log.get(position as usize) else {
                    break;
                };
                match stored.visibility {
                    // Last stable offset: nothing past an open transaction
                    Visibility::Pending => break,
                    Visibility::Aborted => position += 1,
                    Visibility::Committed => {
                        batch.push(stored.record.clone());
                        position += 1;
                    }
                }
            }

            self.positions.insert(partition, position);
        }

        batch
    }

    /// Keep the first `after` records; the rest are unread again.
    fn fail_after(
        &mut self,
        mut batch: Vec<Record>,
        after: usize,
        message: String,
    ) -> Result<Vec<Record>> {
        let keep = after.min(batch.len());
        for unread in batch.drain(keep..) {
            let position = self.positions.entry(unread.partition).or_insert(unread.offset);
            *position = (*position).min(unread.offset);
        }

        if batch.is_empty() {
            return Err(Error::Kafka(KafkaError::Poll(message)));
        }
        warn!(records = batch.len(), error = %message, "Poll error after partial batch");
        self.deferred_error = Some(message);
        Ok(batch)
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<Record>> {
        if let Some(message) = self.deferred_error.take() {
            return Err(Error::Kafka(KafkaError::Poll(message)));
        }

        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notify = Arc::clone(&self.broker.appended);
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.fetch();
            if !batch.is_empty() {
                return match self.poll_faults.pop_front() {
                    Some((after, message)) => self.fail_after(batch, after, message),
                    None => Ok(batch),
                };
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() || tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    fn end_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        self.broker.end_offset(topic, partition)
    }

    fn commit_is_manual(&self) -> bool {
        true
    }

    fn take_revoked(&mut self) -> Vec<(String, i32)> {
        let revoked: Vec<(String, i32)> =
            std::mem::take(&mut *self.revoked.lock()).into_iter().collect();

        // Reassignment resumes from the group's committed position
        for (topic, partition) in &revoked {
            if topic == &self.topic {
                self.positions.remove(partition);
            }
        }

        revoked
    }

    async fn rewind(&mut self, positions: &[OffsetMark]) -> Result<()> {
        for mark in positions {
            if mark.topic != self.topic {
                debug!(topic = %mark.topic, "Skipping rewind of unassigned topic");
                continue;
            }
            self.positions.insert(mark.partition, mark.next_offset);
        }
        Ok(())
    }

    fn group(&self) -> Result<ConsumerGroup> {
        Ok(ConsumerGroup::new(self.group_id.clone()))
    }
}

/// Transactional producer session over a `MemoryBroker`.
pub struct MemorySink {
    broker: MemoryBroker,
    transactional_id: String,
    session: u64,
    slot: TransactionSlot,
    acks: Vec<(Ack, AckResolver)>,
}

impl MemorySink {
    async fn fault(&self, point: FaultPoint) -> Option<FaultAction> {
        let action = self
            .broker
            .state
            .lock()
            .take_fault(&self.transactional_id, point);

        if matches!(action, Some(FaultAction::CrashBefore)) {
            warn!(?point, "Simulated crash before step");
            std::future::pending::<()>().await;
        }
        action
    }

    async fn crash_after(action: &Option<FaultAction>, point: FaultPoint) {
        if matches!(action, Some(FaultAction::CrashAfter)) {
            warn!(?point, "Simulated crash after step");
            std::future::pending::<()>().await;
        }
    }

    fn injected_error(action: &Option<FaultAction>) -> Option<TransactionError> {
        match action {
            Some(FaultAction::Fail(e)) => Some(e.clone()),
            _ => None,
        }
    }

    fn resolve_acks(&mut self, committed: bool) {
        for (ack, resolver) in self.acks.drain(..) {
            if committed {
                resolver.resolve(Ok(ack));
            } else {
                resolver.resolve(Err(TransactionError::Aborted));
            }
        }
    }

    fn abort_in_broker(&mut self) {
        self.broker.state.lock().resolve(self.session, false);
        self.resolve_acks(false);
        self.broker.appended.notify_waiters();
    }

    fn release(&mut self) {
        let mut state = self.broker.state.lock();
        state.end_session(self.session);
    }
}

#[async_trait]
impl TransactionalSink for MemorySink {
    async fn init(&mut self) -> Result<()> {
        let aborted = {
            let mut state = self.broker.state.lock();

            // Abort transactions left behind by dead sessions of this identity
            let dangling: Vec<u64> = state
                .open
                .iter()
                .filter(|(session, txn)| {
                    txn.transactional_id == self.transactional_id
                        && !state.live_sessions.contains(session)
                })
                .map(|(session, _)| *session)
                .collect();
            for session in &dangling {
                state.resolve(*session, false);
            }
            dangling.len()
        };

        if aborted > 0 {
            self.broker.appended.notify_waiters();
        }
        info!(
            transactional_id = %self.transactional_id,
            session = self.session,
            aborted,
            "Memory sink initialized"
        );
        Ok(())
    }

    async fn begin(&mut self) -> Result<TransactionHandle> {
        let action = self.fault(FaultPoint::Begin).await;
        if let Some(e) = Self::injected_error(&action) {
            return Err(e.into());
        }

        {
            let mut state = self.broker.state.lock();
            let holder = *state
                .leases
                .entry(self.transactional_id.clone())
                .or_insert(self.session);
            if holder != self.session {
                // First live session keeps the identity; Kafka instead fences
                // the older producer when a newer one bumps the epoch
                if state.live_sessions.contains(&holder) {
                    return Err(TransactionError::FencingLost {
                        transactional_id: self.transactional_id.clone(),
                        message: format!("identity leased by live session {}", holder),
                    }
                    .into());
                }
                state
                    .leases
                    .insert(self.transactional_id.clone(), self.session);
            }
        }

        let handle = self.slot.open()?;
        self.broker.state.lock().open.insert(
            self.session,
            OpenTransaction {
                transactional_id: self.transactional_id.clone(),
                ..Default::default()
            },
        );

        Self::crash_after(&action, FaultPoint::Begin).await;
        Ok(handle)
    }

    async fn enqueue(
        &mut self,
        handle: &TransactionHandle,
        record: OutboundRecord,
    ) -> Result<PendingAck> {
        self.slot.check(handle)?;

        let action = self.fault(FaultPoint::Enqueue).await;
        if let Some(e) = Self::injected_error(&action) {
            return Err(e.into());
        }

        let ack = {
            let mut state = self.broker.state.lock();
            let partition = state.choose_partition(&record.topic, record.key.as_deref());
            let offset = state.append(
                &record.topic,
                partition,
                record.key,
                record.value,
                record.headers,
                Visibility::Pending,
            );
            if let Some(txn) = state.open.get_mut(&self.session) {
                txn.appended.push((record.topic.clone(), partition, offset));
            }
            Ack {
                topic: record.topic,
                partition,
                offset,
            }
        };

        let (resolver, pending) = PendingAck::channel();
        self.acks.push((ack, resolver));

        Self::crash_after(&action, FaultPoint::Enqueue).await;
        Ok(pending)
    }

    async fn register_offsets(
        &mut self,
        handle: &TransactionHandle,
        marks: &OffsetMarks,
        group: &ConsumerGroup,
    ) -> Result<()> {
        self.slot.check(handle)?;

        let action = self.fault(FaultPoint::RegisterOffsets).await;
        if let Some(e) = Self::injected_error(&action) {
            return Err(e.into());
        }

        if let Some(txn) = self.broker.state.lock().open.get_mut(&self.session) {
            txn.offsets.extend(
                marks
                    .values()
                    .map(|mark| (group.group_id.clone(), mark.clone())),
            );
        }

        Self::crash_after(&action, FaultPoint::RegisterOffsets).await;
        Ok(())
    }

    async fn commit(&mut self, handle: TransactionHandle) -> Result<()> {
        self.slot.close(&handle)?;

        let action = self.fault(FaultPoint::Commit).await;
        if let Some(e) = Self::injected_error(&action) {
            self.abort_in_broker();
            return Err(e.into());
        }

        let resolved = self.broker.state.lock().resolve(self.session, true);
        if resolved.is_none() {
            self.resolve_acks(false);
            return Err(TransactionError::TransactionState(format!(
                "no broker transaction for session {}",
                self.session
            ))
            .into());
        }
        self.resolve_acks(true);
        self.broker.appended.notify_waiters();

        Self::crash_after(&action, FaultPoint::Commit).await;
        Ok(())
    }

    async fn abort(&mut self, handle: TransactionHandle) -> Result<()> {
        self.slot.close(&handle)?;

        let action = self.fault(FaultPoint::Abort).await;
        if let Some(e) = Self::injected_error(&action) {
            self.abort_in_broker();
            return Err(e.into());
        }

        self.abort_in_broker();

        Self::crash_after(&action, FaultPoint::Abort).await;
        Ok(())
    }

    fn transactional_id(&self) -> &str {
        &self.transactional_id
    }

    async fn close(&mut self) -> Result<()> {
        if self.slot.is_open() {
            self.abort_in_broker();
        }
        self.release();
        Ok(())
    }
}

impl Drop for MemorySink {
    fn drop(&mut self) {
        // Open transactions stay dangling until the identity is initialized again
        self.release();
    }
}

impl std::fmt::Debug for MemorySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySink")
            .field("transactional_id", &self.transactional_id)
            .field("session", &self.session)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marks(topic: &str, partition: i32, next: i64) -> OffsetMarks {
        let mut marks = OffsetMarks::new();
        marks.insert(
            (topic.to_string(), partition),
            OffsetMark::at(topic, partition, next),
        );
        marks
    }

    fn outbound(value: &str) -> OutboundRecord {
        OutboundRecord {
            topic: "out".into(),
            key: None,
            value: value.as_bytes().to_vec(),
            headers: vec![],
        }
    }

    #[tokio::test]
    async fn test_pending_records_invisible_until_commit() {
        let broker = MemoryBroker::new();
        let mut sink = broker.sink("t");
        sink.init().await.unwrap();

        let handle = sink.begin().await.unwrap();
        let ack = sink.enqueue(&handle, outbound("a")).await.unwrap();
        sink.register_offsets(&handle, &marks("in", 0, 1), &ConsumerGroup::new("g"))
            .await
            .unwrap();

        assert!(broker.read_committed("out").is_empty());
        assert_eq!(broker.read_uncommitted("out").len(), 1);
        assert_eq!(broker.committed_offset("g", "in", 0), None);

        sink.commit(handle).await.unwrap();
        assert_eq!(broker.read_committed("out").len(), 1);
        assert_eq!(broker.committed_offset("g", "in", 0), Some(1));
        assert_eq!(ack.await.unwrap().offset, 0);
    }

    #[tokio::test]
    async fn test_abort_discards_records_and_offsets() {
        let broker = MemoryBroker::new();
        let mut sink = broker.sink("t");
        sink.init().await.unwrap();

        let handle = sink.begin().await.unwrap();
        let ack = sink.enqueue(&handle, outbound("a")).await.unwrap();
        sink.register_offsets(&handle, &marks("in", 0, 1), &ConsumerGroup::new("g"))
            .await
            .unwrap();
        sink.abort(handle).await.unwrap();

        assert!(broker.read_committed("out").is_empty());
        assert_eq!(broker.committed_offset("g", "in", 0), None);
        assert_eq!(ack.await, Err(TransactionError::Aborted));
    }

    #[tokio::test]
    async fn test_second_live_session_is_fenced() {
        let broker = MemoryBroker::new();
        let mut first = broker.sink("t");
        let mut second = broker.sink("t");
        first.init().await.unwrap();
        second.init().await.unwrap();

        let _handle = first.begin().await.unwrap();
        let err = second.begin().await.unwrap_err();
        assert!(err.is_fencing());

        drop(first);
        assert!(second.begin().await.is_ok());
    }

    #[tokio::test]
    async fn test_init_aborts_dangling_transaction() {
        let broker = MemoryBroker::new();
        let mut crashed = broker.sink("t");
        crashed.init().await.unwrap();
        let handle = crashed.begin().await.unwrap();
        crashed.enqueue(&handle, outbound("lost")).await.unwrap();
        drop(handle);
        drop(crashed);

        assert!(broker.has_open_transaction("t"));

        let mut recovered = broker.sink("t");
        recovered.init().await.unwrap();
        assert!(!broker.has_open_transaction("t"));
        assert!(broker.read_committed("out").is_empty());
    }

    #[tokio::test]
    async fn test_injected_commit_failure_aborts() {
        let broker = MemoryBroker::new();
        broker.inject_fault(
            "t",
            FaultPoint::Commit,
            FaultAction::Fail(TransactionError::TransientBroker("coordinator moved".into())),
        );
        let mut sink = broker.sink("t");
        sink.init().await.unwrap();

        let handle = sink.begin().await.unwrap();
        let ack = sink.enqueue(&handle, outbound("a")).await.unwrap();
        let err = sink.commit(handle).await.unwrap_err();

        assert!(err.is_retryable());
        assert!(!broker.has_open_transaction("t"));
        assert!(broker.read_committed("out").is_empty());
        assert_eq!(ack.await, Err(TransactionError::Aborted));

        // fault was one-shot
        let handle = sink.begin().await.unwrap();
        sink.enqueue(&handle, outbound("b")).await.unwrap();
        sink.commit(handle).await.unwrap();
        assert_eq!(broker.read_committed("out").len(), 1);
    }

    #[tokio::test]
    async fn test_source_stops_at_open_transaction() {
        let broker = MemoryBroker::new();
        broker.produce("in", 0, None, b"before", vec![]);

        let mut sink = broker.sink("t");
        sink.init().await.unwrap();
        let handle = sink.begin().await.unwrap();
        sink.enqueue(
            &handle,
            OutboundRecord {
                topic: "in".into(),
                ..outbound("pending")
            },
        )
        .await
        .unwrap();
        broker.produce("in", 0, None, b"after", vec![]);

        let mut source = broker.source("g", "in", 10);
        let batch = source.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].value, b"before".to_vec());

        sink.abort(handle).await.unwrap();
        let batch = source.poll(Duration::from_millis(10)).await.unwrap();
        let values: Vec<_> = batch.iter().map(|r| r.value.clone()).collect();
        assert_eq!(values, vec![b"after".to_vec()]);
    }

    #[tokio::test]
    async fn test_source_poll_times_out_empty() {
        let broker = MemoryBroker::new();
        let mut source = broker.source("g", "in", 10);
        let batch = source.poll(Duration::from_millis(5)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_source_rewind_and_revocation() {
        let broker = MemoryBroker::new();
        for i in 0..3 {
            broker.produce("in", 0, None, format!("v{}", i).as_bytes(), vec![]);
        }

        let mut source = broker.source("g", "in", 10);
        assert_eq!(source.poll(Duration::from_millis(5)).await.unwrap().len(), 3);
        assert_eq!(source.position(0), 3);

        source.rewind(&[OffsetMark::at("in", 0, 1)]).await.unwrap();
        let batch = source.poll(Duration::from_millis(5)).await.unwrap();
        assert_eq!(batch[0].offset, 1);

        let handle = source.revocation_handle();
        handle.revoke("in", 0);
        assert_eq!(source.take_revoked(), vec![("in".to_string(), 0)]);
        assert!(source.take_revoked().is_empty());
        // nothing committed for the group: reassignment starts from 0
        assert_eq!(source.position(0), 0);
    }

    #[tokio::test]
    async fn test_poll_error_after_partial_batch_is_deferred() {
        let broker = MemoryBroker::new();
        for i in 0..4 {
            broker.produce("in", 0, None, format!("v{}", i).as_bytes(), vec![]);
        }
        let mut source = broker.source("g", "in", 10);
        source.inject_poll_error(2, "connection reset");

        let batch = source.poll(Duration::from_millis(5)).await.unwrap();
        let offsets: Vec<i64> = batch.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 1]);
        assert_eq!(source.position(0), 2);

        let err = source.poll(Duration::from_millis(5)).await.unwrap_err();
        assert!(matches!(err, Error::Kafka(KafkaError::Poll(_))));
        assert!(err.is_retryable());

        let batch = source.poll(Duration::from_millis(5)).await.unwrap();
        let offsets: Vec<i64> = batch.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_poll_error_before_any_record_consumes_nothing() {
        let broker = MemoryBroker::new();
        broker.produce("in", 0, None, b"a", vec![]);
        let mut source = broker.source("g", "in", 10);
        source.inject_poll_error(0, "connection reset");

        assert!(source.poll(Duration::from_millis(5)).await.is_err());
        assert_eq!(source.position(0), 0);
        assert_eq!(source.poll(Duration::from_millis(5)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_end_offset_counts_every_append() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.end_offset("in", 0), None);

        broker.produce("in", 0, None, b"a", vec![]);
        let mut sink = broker.sink("t");
        sink.init().await.unwrap();
        let handle = sink.begin().await.unwrap();
        sink.enqueue(
            &handle,
            OutboundRecord {
                topic: "in".into(),
                ..outbound("pending")
            },
        )
        .await
        .unwrap();
        sink.abort(handle).await.unwrap();

        assert_eq!(broker.end_offset("in", 0), Some(2));
        assert_eq!(broker.end_offset("in", 5), None);
        assert_eq!(broker.source("g", "in", 1).end_offset("in", 0), Some(2));
    }

    #[test]
    fn test_keyed_partitioning_is_stable() {
        let broker = MemoryBroker::new();
        broker.create_topic("out", 4);
        let mut state = broker.state.lock();
        let a = state.choose_partition("out", Some(b"user-1"));
        let b = state.choose_partition("out", Some(b"user-1"));
        assert_eq!(a, b);
        assert!((0..4).contains(&a));
    }
}
