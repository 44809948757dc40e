//! Relay data model: inbound records and offset marks.

use chrono::{DateTime, TimeZone, Utc};
use rdkafka::message::{Header, Headers as _, Message, OwnedHeaders};

/// An ordered header list. Keys may repeat; order is preserved end to end.
pub type Headers = Vec<(String, Vec<u8>)>;

/// A record read from a partitioned log.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Topic name
    pub topic: String,

    /// Partition number
    pub partition: i32,

    /// Offset within the partition
    pub offset: i64,

    /// Record key (optional)
    pub key: Option<Vec<u8>>,

    /// Record payload (tombstones are surfaced as empty)
    pub value: Vec<u8>,

    /// Record headers
    pub headers: Headers,

    /// Broker timestamp
    pub timestamp: DateTime<Utc>,
}

impl Record {
    /// Copy a consumed Kafka message into an owned record.
    pub fn from_message<M: Message>(msg: &M) -> Self {
        let timestamp = msg
            .timestamp()
            .to_millis()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);

        Record {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key: msg.key().map(|k| k.to_vec()),
            value: msg.payload().map(|v| v.to_vec()).unwrap_or_default(),
            headers: msg
                .headers()
                .map(|headers| {
                    headers
                        .iter()
                        .map(|h| (h.key.to_string(), h.value.unwrap_or(&[]).to_vec()))
                        .collect()
                })
                .unwrap_or_default(),
            timestamp,
        }
    }

    /// Get the record key as a string.
    pub fn key_str(&self) -> Option<&str> {
        self.key.as_ref().and_then(|k| std::str::from_utf8(k).ok())
    }

    /// Get the record value as a string.
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

/// Convert a header list into rdkafka's owned form, keeping order.
pub fn owned_headers(headers: &[(String, Vec<u8>)]) -> OwnedHeaders {
    headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(headers.len()), |acc, (k, v)| {
            acc.insert(Header {
                key: k.as_str(),
                value: Some(v.as_slice()),
            })
        })
}

/// Position to resume consumption from for one partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OffsetMark {
    /// Topic name
    pub topic: String,
    /// Partition number
    pub partition: i32,
    /// Next offset to read (processed offset + 1)
    pub next_offset: i64,
}

impl OffsetMark {
    /// Mark for the position following `offset`.
    pub fn after(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            next_offset: offset + 1,
        }
    }

    /// Mark pointing at `offset` itself (used to rewind onto a record).
    pub fn at(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            next_offset: offset,
        }
    }
}
