//! Store subsystem.
//!
//! # Data Flow
//! ```text
//! RetryContext operation
//!     → Store::entry / set_state / add   (change tracking, no I/O)
//!     → Store::save_changes              (one flush = one transaction)
//!         → validate pending entries
//!         → check against persisted rows (keys, versions)
//!         → apply all or nothing
//! ```
//!
//! # Design Decisions
//! - `Store` is the seam between the façade and the persistence engine
//! - Entity identity is key identity
//! - A failed flush leaves the tracker untouched so it can be re-sent

pub mod memory;

use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use thiserror::Error;

pub use memory::{MemoryDatabase, MemoryStore};

/// Lifecycle state of an entity as seen by a store session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// Not tracked by the session.
    Unattached,
    /// Will be inserted on the next flush.
    PendingInsert,
    /// Will be updated on the next flush.
    PendingUpdate,
    /// Will be deleted on the next flush.
    PendingDelete,
    /// Tracked and in sync with the last flush or load.
    Persisted,
}

impl EntityState {
    /// True for every state except `Unattached`.
    pub fn is_tracked(self) -> bool {
        self != EntityState::Unattached
    }

    /// True if the next flush will write this entity.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            EntityState::PendingInsert | EntityState::PendingUpdate | EntityState::PendingDelete
        )
    }
}

/// A single failed constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// A record the store can persist.
pub trait Entity: Clone + PartialEq + Debug + Send + Sync + 'static {
    /// Primary key.
    type Key: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    /// Logical table name, used in logs and errors.
    const TABLE: &'static str;

    fn key(&self) -> Self::Key;

    /// Store-level constraints checked before a flush.
    fn validate(&self) -> Result<(), Vec<Violation>> {
        Ok(())
    }

    /// Reject keys that can never identify a row.
    fn validate_key(&self) -> Result<(), String> {
        Ok(())
    }
}

/// How query results are loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tracking {
    /// Rows are attached to the session; later changes are flushed.
    Tracked,
    /// Rows are detached copies.
    NoTracking,
}

/// Failure reported by a store while flushing or querying.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FlushError {
    #[error("validation failed for {table} {key}: {}", join_violations(.violations))]
    Validation {
        table: &'static str,
        key: String,
        violations: Vec<Violation>,
    },

    #[error("concurrency conflict on {table} {key}: expected {expected} row(s), affected {affected}")]
    Concurrency {
        table: &'static str,
        key: String,
        expected: usize,
        affected: usize,
    },

    #[error("database error {code}: {message}")]
    Database { code: i32, message: String },

    #[error("command timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    #[error("connection lost: {message}")]
    Disconnected { message: String },
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Change-tracking persistence session.
///
/// Methods take `&self`; implementations keep their tracker behind
/// interior mutability. A session is owned by one `RetryContext`.
pub trait Store: Send + Sync {
    /// Current state of `entity` in this session.
    fn entry<T: Entity>(&self, entity: &T) -> EntityState;

    /// Force `entity` into `state`, attaching it first if untracked.
    /// `Unattached` detaches it. The tracked value is replaced by `entity`.
    fn set_state<T: Entity>(&self, entity: &T, state: EntityState);

    /// Attach `entity` as `PendingInsert`.
    fn add<T: Entity>(&self, entity: &T);

    /// True if any persisted row of `T` matches `predicate`.
    fn any<T: Entity>(&self, predicate: &(dyn Fn(&T) -> bool + Sync)) -> Result<bool, FlushError>;

    /// Load every persisted row of `T`.
    fn load<T: Entity>(&self, tracking: Tracking) -> Result<Vec<T>, FlushError>;

    /// Replace the tracked value of `entity`. Returns false if untracked.
    fn refresh<T: Entity>(&self, entity: &T) -> bool;

    /// Number of entries the next flush would write.
    fn pending_changes(&self) -> usize;

    /// Flush all pending changes in one transaction.
    fn save_changes(&self) -> Result<usize, FlushError>;

    /// Asynchronous flush.
    fn save_changes_async(&self) -> impl Future<Output = Result<usize, FlushError>> + Send;
}
