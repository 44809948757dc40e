//! Payload transformation applied between consume and republish.

use crate::kafka::Record;

/// Failure to transform a payload; aborts the whole batch.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TransformError(pub String);

/// The outgoing key and payload derived from an inbound record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transformed {
    /// Outgoing key
    pub key: Option<Vec<u8>>,
    /// Outgoing payload
    pub value: Vec<u8>,
}

/// Maps an inbound record to its outgoing key and payload.
///
/// Headers are not part of the output: the relay carries the inbound
/// headers over and replaces the causality token itself.
pub trait Transform: Send + Sync {
    /// Transform one record.
    fn apply(&self, record: &Record) -> std::result::Result<Transformed, TransformError>;
}

/// Republishes key and payload unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Transform for Passthrough {
    fn apply(&self, record: &Record) -> std::result::Result<Transformed, TransformError> {
        Ok(Transformed {
            key: record.key.clone(),
            value: record.value.clone(),
        })
    }
}

impl<F> Transform for F
where
    F: Fn(&Record) -> std::result::Result<Transformed, TransformError> + Send + Sync,
{
    fn apply(&self, record: &Record) -> std::result::Result<Transformed, TransformError> {
        self(record)
    }
}
