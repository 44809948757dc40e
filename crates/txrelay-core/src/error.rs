//! Error types for the txrelay core library.
//!
//! Uses hierarchical domain-specific errors following the thiserror pattern.
//! Transaction failures are further classified as retryable or fatal so the
//! relay loop can decide between abort-and-retry and process exit.

use rdkafka::error::{KafkaError as RdKafkaError, RDKafkaErrorCode};
use thiserror::Error;

/// Result type alias for txrelay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for txrelay.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Kafka client error outside of a transaction
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Metrics registration or encoding error
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    /// Whether the relay may abort the current batch and try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transaction(e) => e.is_retryable(),
            Error::Kafka(e) => e.is_retryable(),
            Error::Serialization(_) => true,
            Error::Config(_) | Error::Io(_) | Error::Metrics(_) | Error::Shutdown => false,
        }
    }

    /// Whether the process must stop.
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable() && !matches!(self, Error::Shutdown)
    }

    /// Whether this error signals loss of the transactional identity.
    pub fn is_fencing(&self) -> bool {
        matches!(self, Error::Transaction(TransactionError::FencingLost { .. }))
    }
}

/// Kafka client errors (connection, consumer group, polling).
#[derive(Error, Debug)]
pub enum KafkaError {
    /// Failed to connect to broker
    #[error("Connection failed to {broker}: {message}")]
    ConnectionFailed { broker: String, message: String },

    /// Consumer group error
    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),

    /// Partition assignment or seek error
    #[error("Partition assignment error: {0}")]
    PartitionAssignment(String),

    /// Poll error
    #[error("Poll failed: {0}")]
    Poll(String),

    /// Client error outside of the transactional produce path
    #[error("Kafka client error: {0}")]
    Client(String),
}

impl KafkaError {
    /// Poll and assignment hiccups are recoverable by re-polling.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KafkaError::Poll(_) | KafkaError::PartitionAssignment(_)
        )
    }
}

/// Failures of the transactional produce path.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransactionError {
    /// Network blip, leader change, coordinator unavailable
    #[error("Transient broker error: {0}")]
    TransientBroker(String),

    /// Another live session holds the transactional identity
    #[error("Fencing lost for transactional id {transactional_id}: {message}")]
    FencingLost {
        transactional_id: String,
        message: String,
    },

    /// Protocol misuse (second begin, stale handle, foreign handle)
    #[error("Transaction state error: {0}")]
    TransactionState(String),

    /// Partition ownership changed mid-transaction
    #[error("Partitions revoked during transaction: {partitions:?}")]
    PartitionRevoked { partitions: Vec<(String, i32)> },

    /// Payload could not be transformed
    #[error("Record {topic}/{partition}@{offset} could not be transformed: {message}")]
    Serialization {
        topic: String,
        partition: i32,
        offset: i64,
        message: String,
    },

    /// The transaction the record was enqueued in was aborted
    #[error("Transaction aborted")]
    Aborted,

    /// Consecutive batch failures reached the retry bound
    #[error("Giving up after {attempts} failed attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

impl TransactionError {
    /// Whether the batch may be aborted and retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransactionError::TransientBroker(_)
                | TransactionError::PartitionRevoked { .. }
                | TransactionError::Serialization { .. }
                | TransactionError::Aborted
        )
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TransactionError::TransientBroker(_) => "transient_broker",
            TransactionError::FencingLost { .. } => "fencing_lost",
            TransactionError::TransactionState(_) => "transaction_state",
            TransactionError::PartitionRevoked { .. } => "partition_revoked",
            TransactionError::Serialization { .. } => "serialization",
            TransactionError::Aborted => "aborted",
            TransactionError::RetriesExhausted { .. } => "retries_exhausted",
        }
    }

    /// Classify an rdkafka error raised by a transactional producer call.
    pub fn from_producer_error(err: &RdKafkaError, transactional_id: &str) -> Self {
        let code = err.rdkafka_error_code();
        let fatal = match err {
            RdKafkaError::Transaction(e) => e.is_fatal(),
            _ => false,
        };

        if fatal
            || matches!(
                code,
                Some(RDKafkaErrorCode::InvalidProducerEpoch)
                    | Some(RDKafkaErrorCode::ProducerFenced)
                    | Some(RDKafkaErrorCode::TransactionalIdAuthorizationFailed)
            )
        {
            return TransactionError::FencingLost {
                transactional_id: transactional_id.to_string(),
                message: err.to_string(),
            };
        }

        if matches!(code, Some(RDKafkaErrorCode::State)) {
            return TransactionError::TransactionState(err.to_string());
        }

        TransactionError::TransientBroker(err.to_string())
    }
}

// Conversion implementations for external error types

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<RdKafkaError> for Error {
    fn from(err: RdKafkaError) -> Self {
        match err {
            RdKafkaError::Transaction(_) => Error::Transaction(
                TransactionError::from_producer_error(&err, "unknown"),
            ),
            other => Error::Kafka(KafkaError::Client(other.to_string())),
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("invalid value".into());
        assert_eq!(err.to_string(), "Configuration error: invalid value");

        let kafka_err = KafkaError::ConnectionFailed {
            broker: "localhost:9092".into(),
            message: "connection refused".into(),
        };
        let err: Error = kafka_err.into();
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_transaction_error_classification() {
        assert!(TransactionError::TransientBroker("leader moved".into()).is_retryable());
        assert!(TransactionError::PartitionRevoked { partitions: vec![] }.is_retryable());
        assert!(!TransactionError::TransactionState("double begin".into()).is_retryable());

        let fenced: Error = TransactionError::FencingLost {
            transactional_id: "relay-0".into(),
            message: "epoch bumped".into(),
        }
        .into();
        assert!(fenced.is_fatal());
        assert!(fenced.is_fencing());
    }

    #[test]
    fn test_shutdown_is_neither_fatal_nor_retryable() {
        let err = Error::Shutdown;
        assert!(!err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_producer_error_classification() {
        let err = RdKafkaError::MessageProduction(RDKafkaErrorCode::InvalidProducerEpoch);
        assert!(matches!(
            TransactionError::from_producer_error(&err, "relay-0"),
            TransactionError::FencingLost { .. }
        ));

        let err = RdKafkaError::MessageProduction(RDKafkaErrorCode::BrokerTransportFailure);
        assert!(matches!(
            TransactionError::from_producer_error(&err, "relay-0"),
            TransactionError::TransientBroker(_)
        ));

        let err = RdKafkaError::MessageProduction(RDKafkaErrorCode::State);
        assert!(matches!(
            TransactionError::from_producer_error(&err, "relay-0"),
            TransactionError::TransactionState(_)
        ));
    }

    #[test]
    fn test_rdkafka_error_conversion() {
        let err: Error = RdKafkaError::ClientCreation("bad config".into()).into();
        assert!(matches!(err, Error::Kafka(KafkaError::Client(_))));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(TransactionError::Aborted.kind(), "aborted");
        assert_eq!(
            TransactionError::RetriesExhausted {
                attempts: 3,
                last_error: "x".into()
            }
            .kind(),
            "retries_exhausted"
        );
    }
}
