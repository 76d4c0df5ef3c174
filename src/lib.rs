//! Retry-wrapped persistence façade.
//!
//! A `RetryContext` stages inserts, updates and deletes on a change-tracking
//! `Store` session and runs every flush through a `RetryPolicy`, so transient
//! infrastructure failures are retried with backoff instead of surfacing on
//! the first failure.

pub mod config;
pub mod context;
pub mod error;
pub mod observability;
pub mod resilience;
pub mod store;

pub use config::StoreConfig;
pub use context::{ContextFactory, Query, ReadonlyQuery, RetryContext};
pub use error::{ContextError, ContextResult};
pub use resilience::{CancelSource, CancelToken, RetryPolicy, RetryStrategy};
pub use store::{Entity, EntityState, FlushError, MemoryDatabase, MemoryStore, Store, Violation};
