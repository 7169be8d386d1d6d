//! Metric store errors.

use thiserror::Error;

/// Result type alias using [`ExporterError`].
pub type Result<T> = std::result::Result<T, ExporterError>;

/// Errors raised by the [`MetricStore`](crate::MetricStore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExporterError {
    /// A metric with this name was registered before.
    #[error("The metric '{0}' is already registered")]
    AlreadyRegistered(String),

    /// A value was set for a metric that was never registered.
    #[error("Cannot set not registered metric '{0}'")]
    UnknownMetric(String),
}
