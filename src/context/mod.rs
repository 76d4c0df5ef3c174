//! Context subsystem.
//!
//! # Data Flow
//! ```text
//! caller
//!     → RetryContext::save / delete / save_or_update
//!         → guard.rs (one operation at a time)
//!         → stage on Store (add / set_state / any)
//!         → RetryPolicy::execute(Store::save_changes)
//!     ← rows written, or ContextError
//!
//! ContextFactory
//!     → create() = new store session + current policy
//!     → reload() swaps the policy for later contexts
//! ```

mod guard;

pub mod factory;
pub mod query;
pub mod retry_context;

pub use factory::ContextFactory;
pub use query::{Query, ReadonlyQuery};
pub use retry_context::RetryContext;
