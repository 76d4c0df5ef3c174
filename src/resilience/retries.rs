//! Retry policy.
//!
//! # Responsibilities
//! - Run a flush, classify its failure, wait and re-run
//! - Stop at the strategy's attempt budget
//! - Honour cancellation at attempt boundaries (async only)
//!
//! # Design Decisions
//! - The policy never re-applies work around the call; only `f` is repeated
//! - Non-transient failures surface on first occurrence
//! - The last failure is returned unchanged once the budget is spent

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::RetryConfig;
use crate::observability::metrics;
use crate::resilience::backoff::RetryStrategy;
use crate::resilience::cancel::CancelToken;
use crate::resilience::transient::{SqlTransientDetection, TransientErrorDetection, NeverTransient};
use crate::store::FlushError;

/// Why a retried call gave up.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetryError {
    #[error("retry budget exhausted after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: FlushError },

    #[error("non-transient failure on attempt {attempts}: {error}")]
    Aborted { attempts: u32, error: FlushError },

    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

impl RetryError {
    /// Attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::Aborted { attempts, .. }
            | RetryError::Cancelled { attempts } => *attempts,
        }
    }
}

/// Passed to the retry listener before each backoff wait.
#[derive(Debug)]
pub struct RetryEvent<'a> {
    /// The attempt that just failed (1-based).
    pub attempt: u32,
    pub delay: Duration,
    pub error: &'a FlushError,
}

type RetryListener = Arc<dyn Fn(&RetryEvent<'_>) + Send + Sync>;

enum Step {
    Retry(Duration),
    GiveUp(RetryError),
}

/// Immutable retry policy: a backoff schedule plus a transient classifier.
#[derive(Clone)]
pub struct RetryPolicy {
    strategy: RetryStrategy,
    detection: Arc<dyn TransientErrorDetection>,
    listener: Option<RetryListener>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("strategy", &self.strategy)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(SqlTransientDetection::default(), RetryStrategy::default_exponential())
    }
}

impl RetryPolicy {
    pub fn new<D>(detection: D, strategy: RetryStrategy) -> Self
    where
        D: TransientErrorDetection + 'static,
    {
        Self {
            strategy,
            detection: Arc::new(detection),
            listener: None,
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self::new(NeverTransient, RetryStrategy::fixed(1, Duration::ZERO))
    }

    /// Build a policy from configuration, using SQL transient detection.
    pub fn from_config(config: &RetryConfig) -> Self {
        let base = Duration::from_millis(config.base_delay_ms);
        let strategy = match config.strategy.as_str() {
            "fixed" => RetryStrategy::fixed(config.max_attempts, base),
            "incremental" => RetryStrategy::incremental(
                config.max_attempts,
                base,
                Duration::from_millis(config.increment_ms),
            ),
            _ => RetryStrategy::ExponentialBackoff {
                max_attempts: config.max_attempts,
                min_backoff: base,
                max_backoff: Duration::from_millis(config.max_delay_ms),
                jitter: config.jitter,
                fast_first_retry: false,
            },
        }
        .with_fast_first_retry(config.fast_first_retry);

        Self::new(
            SqlTransientDetection::with_codes(config.extra_transient_codes.iter().copied()),
            strategy,
        )
    }

    /// Call `listener` before every backoff wait.
    pub fn with_retry_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&RetryEvent<'_>) + Send + Sync + 'static,
    {
        self.listener = Some(Arc::new(listener));
        self
    }

    pub fn strategy(&self) -> &RetryStrategy {
        &self.strategy
    }

    pub fn max_attempts(&self) -> u32 {
        self.strategy.max_attempts()
    }

    pub fn is_transient(&self, error: &FlushError) -> bool {
        self.detection.is_transient(error)
    }

    fn next_step(&self, attempt: u32, error: FlushError) -> Step {
        if !self.detection.is_transient(&error) {
            metrics::record_flush("aborted", attempt);
            return Step::GiveUp(RetryError::Aborted {
                attempts: attempt,
                error,
            });
        }
        if attempt >= self.strategy.max_attempts() {
            tracing::error!(attempts = attempt, error = %error, "Retry budget exhausted");
            metrics::record_flush("exhausted", attempt);
            return Step::GiveUp(RetryError::Exhausted {
                attempts: attempt,
                last: error,
            });
        }

        let delay = self.strategy.delay_for(attempt);
        tracing::warn!(attempt, delay = ?delay, error = %error, "Transient failure, retrying");
        metrics::record_retry(retry_reason(&error));
        if let Some(listener) = &self.listener {
            listener(&RetryEvent {
                attempt,
                delay,
                error: &error,
            });
        }
        Step::Retry(delay)
    }

    /// Run `f` until it succeeds, fails permanently or the budget is spent.
    /// Blocks the calling thread during backoff.
    pub fn execute<T, F>(&self, mut f: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Result<T, FlushError>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f() {
                Ok(value) => {
                    metrics::record_flush("success", attempt);
                    return Ok(value);
                }
                Err(error) => match self.next_step(attempt, error) {
                    Step::GiveUp(err) => return Err(err),
                    Step::Retry(delay) => {
                        if !delay.is_zero() {
                            std::thread::sleep(delay);
                        }
                    }
                },
            }
        }
    }

    /// Asynchronous `execute`. Cancellation is checked before every attempt
    /// and while waiting; an attempt already running is not interrupted.
    pub async fn execute_async<T, F, Fut>(
        &self,
        mut f: F,
        cancel: Option<&CancelToken>,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FlushError>>,
    {
        let mut attempt = 0;
        loop {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                tracing::debug!(attempts = attempt, "Retry loop cancelled");
                metrics::record_flush("cancelled", attempt);
                return Err(RetryError::Cancelled { attempts: attempt });
            }

            attempt += 1;
            let error = match f().await {
                Ok(value) => {
                    metrics::record_flush("success", attempt);
                    return Ok(value);
                }
                Err(error) => error,
            };

            let delay = match self.next_step(attempt, error) {
                Step::GiveUp(err) => return Err(err),
                Step::Retry(delay) => delay,
            };

            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => {
                            tracing::debug!(attempts = attempt, "Retry backoff cancelled");
                            metrics::record_flush("cancelled", attempt);
                            return Err(RetryError::Cancelled { attempts: attempt });
                        }
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }
}

fn retry_reason(error: &FlushError) -> &'static str {
    match error {
        FlushError::Timeout { .. } => "timeout",
        FlushError::Disconnected { .. } => "disconnected",
        FlushError::Database { .. } => "database",
        FlushError::Validation { .. } | FlushError::Concurrency { .. } => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::cancel::CancelSource;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn transient() -> FlushError {
        FlushError::Disconnected {
            message: "connection reset".into(),
        }
    }

    fn quick(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            SqlTransientDetection::default(),
            RetryStrategy::fixed(attempts, Duration::ZERO),
        )
    }

    #[test]
    fn test_succeeds_on_last_attempt() {
        let calls = AtomicU32::new(0);
        let result = quick(3).execute(|| {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(transient())
            } else {
                Ok(1)
            }
        });
        assert_eq!(result, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_exhausted_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = quick(4).execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(transient())
        });
        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 4,
                last: transient()
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_non_transient_not_retried() {
        let calls = AtomicU32::new(0);
        let permanent = FlushError::Database {
            code: 2627,
            message: "duplicate".into(),
        };
        let result: Result<(), _> = quick(5).execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(permanent.clone())
        });
        assert_eq!(result.unwrap_err().attempts(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_sees_each_retry() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let policy = quick(3).with_retry_listener(move |event| {
            sink.lock().unwrap().push(event.attempt);
        });
        let _: Result<(), _> = policy.execute(|| Err(transient()));
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_from_config() {
        let mut config = RetryConfig::default();
        config.strategy = "fixed".into();
        config.max_attempts = 4;
        config.base_delay_ms = 250;
        config.fast_first_retry = false;
        config.extra_transient_codes = vec![50001];

        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.strategy(), &RetryStrategy::fixed(4, Duration::from_millis(250)));
        assert!(policy.is_transient(&FlushError::Database {
            code: 50001,
            message: String::new()
        }));
    }

    #[tokio::test]
    async fn test_async_cancelled_before_first_attempt() {
        let source = CancelSource::new();
        source.cancel();
        let token = source.token();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = quick(3)
            .execute_async(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
                Some(&token),
            )
            .await;

        assert_eq!(result, Err(RetryError::Cancelled { attempts: 0 }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_backoff_waits() {
        let policy = RetryPolicy::new(
            SqlTransientDetection::default(),
            RetryStrategy::fixed(3, Duration::from_secs(5)),
        );
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result = policy
            .execute_async(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(transient())
                        } else {
                            Ok(n)
                        }
                    }
                },
                None,
            )
            .await;

        assert_eq!(result, Ok(2));
        assert!(started.elapsed() >= Duration::from_secs(10));
    }
}
