//! Worker error types and error categorization
//!
//! - [`ConnectionError`]: dial/auth/network failures, retried with backoff
//!   until the retry budget is exhausted (then fatal)
//! - [`FetchError`]: a job source operation failed; the loop reconnects and retries
//! - [`ProcessingError`]: a single item failed; never stops the loop
//! - [`WorkerError`]: what ends [`Worker::run`](crate::Worker::run) abnormally

use std::time::Duration;
use thiserror::Error;

/// Category of a per-item failure, decides between retry and dead-letter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure - requeue until the retry budget runs out
    Transient,
    /// Unrecoverable error - move to the dead-letter destination immediately
    Permanent,
}

/// Connection lifecycle errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Redis client error (dial refused, AUTH rejected, bad database index, ...)
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Dial or round trip took longer than allowed
    #[error("Timed out after {0:?} waiting for Redis")]
    Timeout(Duration),

    /// PING answered with something other than PONG
    #[error("Unexpected PING reply: {0}")]
    UnexpectedReply(String),

    /// Redis could not be reached for another reason
    #[error("Redis unavailable: {0}")]
    Unavailable(String),

    /// Reconnect budget exhausted
    #[error("Gave up after {attempts} connection attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<ConnectionError>,
    },
}

impl ConnectionError {
    /// True once the reconnect budget has been used up
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectionError::Exhausted { .. })
    }
}

/// Job source errors
#[derive(Error, Debug)]
pub enum FetchError {
    /// Redis command failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// No usable connection
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Envelope could not be encoded/decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl FetchError {
    /// Whether the failure means the session itself is broken and should be re-dialed
    pub fn is_connection_error(&self) -> bool {
        match self {
            FetchError::Redis(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
            }
            FetchError::Connection(_) => true,
            FetchError::Serialization(_) => false,
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::Serialization(err.to_string())
    }
}

/// Failure reported by a [`WorkProcessor`](crate::WorkProcessor) for one item
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ProcessingError {
    pub message: String,
    pub category: ErrorCategory,
}

impl ProcessingError {
    /// Create a retryable processing error
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::Transient,
        }
    }

    /// Create a non-retryable processing error
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category == ErrorCategory::Transient
    }
}

/// Fatal worker errors, surfaced to the process boundary
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Fatal connection error: {0}")]
    Connection(#[from] ConnectionError),
}
