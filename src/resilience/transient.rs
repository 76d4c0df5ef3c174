//! Transient error classification.
//!
//! # Responsibilities
//! - Decide whether a flush failure is worth another attempt
//!
//! # Design Decisions
//! - Validation and concurrency failures are never transient
//! - Timeouts and dropped connections are always transient
//! - Database errors are transient only for known codes

use crate::store::FlushError;

/// Engine error codes that indicate a transient condition.
pub const TRANSIENT_SQL_CODES: &[i32] = &[
    // Throttling and resource limits
    40501, 10928, 10929, 49918, 49919, 49920,
    // Service busy, unavailable or reconfiguring
    40197, 40540, 40613, 40143, 4060, 4221,
    // Deadlock victim
    1205,
    // Transport-level failures
    233, 64, 20, 121, 10053, 10054, 10060,
];

/// Classifies flush failures as retry-eligible.
pub trait TransientErrorDetection: Send + Sync {
    fn is_transient(&self, error: &FlushError) -> bool;
}

impl<F> TransientErrorDetection for F
where
    F: Fn(&FlushError) -> bool + Send + Sync,
{
    fn is_transient(&self, error: &FlushError) -> bool {
        self(error)
    }
}

/// Default classifier for SQL-style engines.
#[derive(Debug, Clone, Default)]
pub struct SqlTransientDetection {
    extra_codes: Vec<i32>,
}

impl SqlTransientDetection {
    /// Also treat `codes` as transient.
    pub fn with_codes(codes: impl IntoIterator<Item = i32>) -> Self {
        Self {
            extra_codes: codes.into_iter().collect(),
        }
    }
}

impl TransientErrorDetection for SqlTransientDetection {
    fn is_transient(&self, error: &FlushError) -> bool {
        match error {
            FlushError::Timeout { .. } | FlushError::Disconnected { .. } => true,
            FlushError::Database { code, .. } => {
                TRANSIENT_SQL_CODES.contains(code) || self.extra_codes.contains(code)
            }
            FlushError::Validation { .. } | FlushError::Concurrency { .. } => false,
        }
    }
}

/// Treats every failure as permanent.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverTransient;

impl TransientErrorDetection for NeverTransient {
    fn is_transient(&self, _error: &FlushError) -> bool {
        false
    }
}
