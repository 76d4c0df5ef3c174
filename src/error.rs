//! Error types for context operations.

use thiserror::Error;

use crate::resilience::retries::RetryError;
use crate::store::{FlushError, Violation};

/// Result type for context operations.
pub type ContextResult<T> = Result<T, ContextError>;

/// Errors surfaced by `RetryContext`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ContextError {
    /// An entity failed store-level constraints. Never retried.
    #[error("validation failed for {table} {key}: {} violation(s)", .violations.len())]
    Validation {
        table: &'static str,
        key: String,
        violations: Vec<Violation>,
    },

    /// Affected-row count did not match; the row changed or vanished since it was read.
    #[error("concurrency conflict on {table} {key}: expected {expected} row(s), affected {affected}")]
    Concurrency {
        table: &'static str,
        key: String,
        expected: usize,
        affected: usize,
    },

    /// The flush failed; `source` is the last underlying failure.
    #[error("persistence failed after {attempts} attempt(s)")]
    Persistence {
        attempts: u32,
        #[source]
        source: FlushError,
    },

    /// Misuse: overlapping operations or a disposed context.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Invalid argument to a public operation.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// Cancelled before an attempt could start.
    #[error("operation cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

impl ContextError {
    /// Classify a store failure seen after `attempts` attempts.
    pub fn from_flush(attempts: u32, error: FlushError) -> Self {
        match error {
            FlushError::Validation {
                table,
                key,
                violations,
            } => ContextError::Validation {
                table,
                key,
                violations,
            },
            FlushError::Concurrency {
                table,
                key,
                expected,
                affected,
            } => ContextError::Concurrency {
                table,
                key,
                expected,
                affected,
            },
            source => ContextError::Persistence { attempts, source },
        }
    }

    /// True if the caller should re-read and try again.
    pub fn is_retryable_by_caller(&self) -> bool {
        matches!(self, ContextError::Concurrency { .. })
    }
}

impl From<RetryError> for ContextError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::Aborted { attempts, error } => ContextError::from_flush(attempts, error),
            RetryError::Exhausted { attempts, last } => {
                ContextError::Persistence { attempts, source: last }
            }
            RetryError::Cancelled { attempts } => ContextError::Cancelled { attempts },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_exhausted_transient_becomes_persistence() {
        let last = FlushError::Disconnected {
            message: "reset".into(),
        };
        let err = ContextError::from(RetryError::Exhausted {
            attempts: 3,
            last: last.clone(),
        });
        assert_eq!(
            err,
            ContextError::Persistence {
                attempts: 3,
                source: last
            }
        );
        assert_eq!(
            err.source().map(ToString::to_string),
            Some("connection lost: reset".to_string())
        );
    }

    #[test]
    fn test_concurrency_keeps_its_kind() {
        let err = ContextError::from(RetryError::Aborted {
            attempts: 1,
            error: FlushError::Concurrency {
                table: "orders",
                key: "9".into(),
                expected: 1,
                affected: 0,
            },
        });
        assert!(err.is_retryable_by_caller());
        assert!(matches!(err, ContextError::Concurrency { table: "orders", .. }));
    }

    #[test]
    fn test_non_transient_database_error_is_persistence() {
        let err = ContextError::from(RetryError::Aborted {
            attempts: 1,
            error: FlushError::Database {
                code: 2627,
                message: "duplicate".into(),
            },
        });
        assert!(matches!(err, ContextError::Persistence { attempts: 1, .. }));
    }
}
