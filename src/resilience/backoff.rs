//! Backoff schedules.

use std::time::Duration;
use rand::Rng;

/// Calculate exponential backoff delay with jitter.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let capped_delay = capped_exponential_ms(attempt, base_ms, max_ms);

    // Apply jitter (0 to 10% of the delay)
    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay.saturating_add(jitter))
}

/// Exponential backoff delay without jitter.
pub fn calculate_backoff_exact(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    Duration::from_millis(capped_exponential_ms(attempt, base_ms, max_ms))
}

fn capped_exponential_ms(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    if attempt == 0 {
        return 0;
    }
    let exponential_base = 2u64.saturating_pow(attempt - 1);
    base_ms.saturating_mul(exponential_base).min(max_ms)
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// How long to wait between attempts, and how many attempts to make.
///
/// `max_attempts` counts every attempt, the first included.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    /// Same delay before every retry.
    FixedInterval {
        max_attempts: u32,
        interval: Duration,
        fast_first_retry: bool,
    },
    /// Delay grows linearly: `initial + increment * (retry - 1)`.
    Incremental {
        max_attempts: u32,
        initial: Duration,
        increment: Duration,
        fast_first_retry: bool,
    },
    /// Delay doubles from `min_backoff` up to `max_backoff`.
    ExponentialBackoff {
        max_attempts: u32,
        min_backoff: Duration,
        max_backoff: Duration,
        jitter: bool,
        fast_first_retry: bool,
    },
}

impl RetryStrategy {
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self::FixedInterval {
            max_attempts,
            interval,
            fast_first_retry: false,
        }
    }

    pub fn incremental(max_attempts: u32, initial: Duration, increment: Duration) -> Self {
        Self::Incremental {
            max_attempts,
            initial,
            increment,
            fast_first_retry: false,
        }
    }

    pub fn exponential(max_attempts: u32, min_backoff: Duration, max_backoff: Duration) -> Self {
        Self::ExponentialBackoff {
            max_attempts,
            min_backoff,
            max_backoff,
            jitter: true,
            fast_first_retry: false,
        }
    }

    /// Ten retries, 1s doubling to 30s, jittered, first retry immediate.
    pub fn default_exponential() -> Self {
        Self::ExponentialBackoff {
            max_attempts: 11,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            jitter: true,
            fast_first_retry: true,
        }
    }

    /// Ten retries one second apart, first retry immediate.
    pub fn default_fixed() -> Self {
        Self::FixedInterval {
            max_attempts: 11,
            interval: Duration::from_secs(1),
            fast_first_retry: true,
        }
    }

    pub fn with_fast_first_retry(mut self, enabled: bool) -> Self {
        match &mut self {
            Self::FixedInterval { fast_first_retry, .. }
            | Self::Incremental { fast_first_retry, .. }
            | Self::ExponentialBackoff { fast_first_retry, .. } => *fast_first_retry = enabled,
        }
        self
    }

    /// Total attempts, never less than one.
    pub fn max_attempts(&self) -> u32 {
        let n = match self {
            Self::FixedInterval { max_attempts, .. }
            | Self::Incremental { max_attempts, .. }
            | Self::ExponentialBackoff { max_attempts, .. } => *max_attempts,
        };
        n.max(1)
    }

    fn fast_first_retry(&self) -> bool {
        match self {
            Self::FixedInterval { fast_first_retry, .. }
            | Self::Incremental { fast_first_retry, .. }
            | Self::ExponentialBackoff { fast_first_retry, .. } => *fast_first_retry,
        }
    }

    /// Delay before retry number `retry` (1 = the wait after the first failure).
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 || (retry == 1 && self.fast_first_retry()) {
            return Duration::ZERO;
        }
        match self {
            Self::FixedInterval { interval, .. } => *interval,
            Self::Incremental {
                initial, increment, ..
            } => initial.saturating_add(increment.saturating_mul(retry - 1)),
            Self::ExponentialBackoff {
                min_backoff,
                max_backoff,
                jitter,
                fast_first_retry,
                ..
            } => {
                // With a fast first retry the exponential series starts at retry 2.
                let step = if *fast_first_retry { retry - 1 } else { retry };
                if *jitter {
                    calculate_backoff(step, millis(*min_backoff), millis(*max_backoff))
                } else {
                    calculate_backoff_exact(step, millis(*min_backoff), millis(*max_backoff))
                }
            }
        }
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::default_exponential()
    }
}
