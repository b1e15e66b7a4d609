//! Error types for counter operations.
//!
//! Every fallible engine operation returns [`Result`]. Storage backends use
//! the same [`Error`] so that a conflict raised deep inside a transaction
//! reaches the caller unchanged.
//!
//! Cache failures are deliberately not part of [`Error`]: the aggregate cache
//! is a read-path optimization, so the engine logs a [`CacheError`] and falls
//! back to storage instead of failing the call.

use std::fmt;

use thiserror::Error;

/// Why an operation stopped before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller cancelled the [`Context`](crate::context::Context).
    Cancelled,
    /// The context deadline passed.
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Cancelled => write!(f, "cancelled by caller"),
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// Errors returned by counter operations and storage backends.
#[derive(Debug, Error)]
pub enum Error {
    /// Transient failure reaching the shard or config store. Safe to retry.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Optimistic commit kept conflicting until the retry budget ran out.
    ///
    /// No write of the failed transaction is visible.
    #[error("transaction conflict on {key} after {attempts} attempts")]
    TransactionConflict {
        /// The record whose validation failed on the last attempt.
        key: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// The caller's context fired before the operation finished.
    #[error("operation cancelled: {0}")]
    Cancelled(CancelReason),

    /// Rejected input, such as an empty counter name or a zero shard count.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A shard count or aggregate would leave the `i64` range.
    #[error("counter overflow: {0}")]
    Overflow(String),
}

/// Result type for counter operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns `true` if retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StorageUnavailable(_) | Error::TransactionConflict { .. }
        )
    }

    /// Returns `true` if the operation was cancelled or timed out.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// Returns `true` for an exhausted optimistic transaction.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::TransactionConflict { .. })
    }
}

/// Failure of an [`AggregateCache`](crate::cache::AggregateCache) backend.
///
/// Never surfaced from engine operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache could not be reached.
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}
