//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → StoreConfig (validated, immutable)
//!     → RetryPolicy::from_config / ContextFactory
//!
//! On file change (ContextFactory::follow_file):
//!     watcher.rs detects change, waits for the content to settle
//!     → loader.rs parses new config
//!     → validation.rs validates
//!     → ContextFactory::follow swaps the policy for new contexts
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Live contexts keep the policy they were built with

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::ConnectionConfig;
pub use schema::ObservabilityConfig;
pub use schema::RetryConfig;
pub use schema::StoreConfig;
