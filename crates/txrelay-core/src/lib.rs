//! txrelay core - exactly-once transactional relay between Kafka topics
//!
//! This library consumes records from a source topic, transforms them and
//! republishes them to a destination topic with:
//!
//! - One producer transaction per batch covering both the produced records
//!   and the consumer-group offset advancement
//! - Read-committed consumption and manual offset management
//! - W3C trace context propagation through record headers, with span links
//!   connecting each consumed record to the span that produced it
//! - Spans exported only for committed batches, so retries never duplicate them

pub mod config;
pub mod error;
pub mod health;
pub mod kafka;
pub mod memory;
pub mod metrics;
pub mod propagation;
pub mod relay;
pub mod span;
pub mod transform;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use error::{KafkaError, TransactionError};
pub use relay::{IterationOutcome, Relay, RelaySettings, RelayState, RelayStats};
