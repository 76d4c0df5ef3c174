//! Metrics collection and exposition.
//!
//! # Metrics
//! - `store_flush_total` (counter): flushes by outcome
//!   (success, aborted, exhausted, cancelled)
//! - `store_flush_attempts` (histogram): attempts per flush
//! - `store_retry_total` (counter): retries by failure reason
//! - `store_pending_changes` (gauge): pending entries before the last flush

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its scrape endpoint.
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_flush(outcome: &'static str, attempts: u32) {
    metrics::counter!("store_flush_total", "outcome" => outcome).increment(1);
    metrics::histogram!("store_flush_attempts").record(f64::from(attempts));
}

pub fn record_retry(reason: &'static str) {
    metrics::counter!("store_retry_total", "reason" => reason).increment(1);
}

pub fn record_pending_changes(count: usize) {
    metrics::gauge!("store_pending_changes").set(count as f64);
}
