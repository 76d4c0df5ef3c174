//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Flush requested:
//!     → retries.rs (run the flush, classify failure)
//!     → transient.rs (retry-eligible?)
//!     → backoff.rs (how long to wait)
//!     → cancel.rs (stop between attempts)
//! ```
//!
//! # Design Decisions
//! - Retries only for transient failures
//! - Jittered exponential backoff by default
//! - Policies are immutable and cheap to clone

pub mod backoff;
pub mod cancel;
pub mod retries;
pub mod transient;

pub use backoff::RetryStrategy;
pub use cancel::{CancelSource, CancelToken};
pub use retries::{RetryError, RetryEvent, RetryPolicy};
pub use transient::{NeverTransient, SqlTransientDetection, TransientErrorDetection};
