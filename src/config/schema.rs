//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Store connection settings.
    pub store: ConnectionConfig,

    /// Retry policy applied to every flush.
    pub retries: RetryConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Store connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Logical store name for logging.
    pub name: String,

    /// Per-flush command timeout in milliseconds (0 = none).
    pub command_timeout_ms: u64,

    /// Artificial latency added to each flush (in-memory store only).
    pub simulated_latency_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            command_timeout_ms: 30_000,
            simulated_latency_ms: 0,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Backoff schedule: "exponential", "fixed" or "incremental".
    pub strategy: String,

    /// Total attempts per flush, the first included.
    pub max_attempts: u32,

    /// Base delay in milliseconds (interval for "fixed", initial for "incremental").
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Added per retry by the incremental strategy.
    pub increment_ms: u64,

    /// Retry the first failure immediately.
    pub fast_first_retry: bool,

    /// Jitter exponential delays.
    pub jitter: bool,

    /// Extra engine error codes to treat as transient.
    pub extra_transient_codes: Vec<i32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: "exponential".to_string(),
            max_attempts: 11,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            increment_ms: 1000,
            fast_first_retry: true,
            jitter: true,
            extra_transient_codes: Vec::new(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format ("pretty" or "json").
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
