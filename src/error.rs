//! Error types for every fallible surface of the agent.
//!
//! Dispatch errors never reach request-handling code: the dispatcher converts
//! them into log output and re-buffers the snapshot. The remaining types are
//! raised eagerly to whoever configures dynos or polls measurements.

use thiserror::Error;

/// Why a dispatch attempt did not deliver its snapshot.
///
/// The `Display` strings are the operator-facing log messages, so keep them
/// stable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// No delivery token configured. Raised before any network I/O.
    #[error(
        "The HIREFIRE_TOKEN environment variable is not set. Unable to submit \
         Request Queue Time metric data. The HIREFIRE_TOKEN can be found in \
         the HireFire Web UI in the web dyno manager settings."
    )]
    MissingToken,

    /// The collector answered with a non-2xx status.
    #[error("HTTP error occurred: {status} {body}")]
    Rejected { status: u16, body: String },

    /// The attempt did not complete within the dispatch timeout.
    #[error("The request to the server timed out.")]
    Timeout,

    /// Any other I/O fault: DNS, connect, TLS, body encoding.
    #[error("Error occurred during request: {0}")]
    Request(String),
}

impl DispatchError {
    /// `true` for the configuration class of failure (nothing was sent).
    pub fn is_configuration(&self) -> bool {
        matches!(self, DispatchError::MissingToken)
    }
}

/// Raised when registering a worker dyno.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    #[error(
        "Invalid dyno name `{0}`. It must start with a letter, contain only \
         letters, digits, hyphens and underscores, and be at most 30 characters."
    )]
    InvalidDynoName(String),
}

/// Raised by job queue introspection.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// A measurement was requested without naming any queue.
    #[error("No queue was specified. Please specify at least one queue.")]
    MissingQueue,

    #[cfg(feature = "rq")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A stored value could not be interpreted.
    #[error("Malformed broker data: {0}")]
    Malformed(String),

    /// The blocking broker call panicked or was cancelled.
    #[error("Broker task failed: {0}")]
    Task(String),
}

/// Raised when a measurement provider fails to produce a value.
#[derive(Debug, Error)]
pub enum MeasureError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("{0}")]
    Other(String),
}
