//! Partitioned log plumbing: records, the manual-commit source, offset
//! tracking and the transactional sink.

mod offset;
mod record;
mod sink;
mod source;

pub use offset::{BatchOffsets, OffsetTracker};
pub use record::{owned_headers, Headers, OffsetMark, Record};
pub use sink::{
    Ack, AckResolver, KafkaTransactionalSink, OffsetMarks, OutboundRecord, PendingAck,
    TransactionHandle, TransactionSlot, TransactionalSink,
};
pub use source::{
    ConsumerGroup, KafkaRecordSource, KafkaSourceBuilder, RecordSource, RetryConfig,
    RevocationContext,
};
