//! Metrics collection and export.

mod relay;

pub use relay::RelayMetrics;
