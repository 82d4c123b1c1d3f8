//! Activity policies: timeouts and retry
//!
//! Defaults are tuned for banking calls: few attempts, short backoff, and an
//! explicit list of business errors that must never be retried.

use std::time::Duration;

use crate::ledger::LedgerError;

/// Retry policy for one activity
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the second attempt
    pub initial_interval: Duration,
    /// Multiplier applied per attempt (>= 1.0)
    pub backoff_coefficient: f64,
    /// Upper bound for a single delay
    pub max_interval: Duration,
    /// Total attempts including the first. 0 = unlimited (bounded by schedule_to_close)
    pub max_attempts: u32,
    /// Error codes that short-circuit to a permanent failure
    pub non_retryable_error_types: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            backoff_coefficient: 1.5,
            max_interval: Duration::from_secs(15),
            max_attempts: 3,
            non_retryable_error_types: LedgerError::default_non_retryable(),
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after failed attempt `attempt` (1-based)
    ///
    /// `min(initial * coefficient^(attempt-1), max_interval)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let coefficient = self.backoff_coefficient.max(1.0);
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_interval.as_secs_f64() * coefficient.powi(exponent);
        let max = self.max_interval.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            return self.max_interval;
        }
        Duration::from_secs_f64(secs)
    }

    pub fn is_non_retryable(&self, code: &str) -> bool {
        self.non_retryable_error_types.iter().any(|c| c == code)
    }

    /// True when `attempt` was the last one allowed
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts != 0 && attempt >= self.max_attempts
    }
}

/// Per-invocation policy
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityOptions {
    /// Wall clock for a single attempt
    pub start_to_close_timeout: Duration,
    /// Maximum wait for a worker slot before an attempt starts
    pub schedule_to_start_timeout: Duration,
    /// Total budget including retries and backoff
    pub schedule_to_close_timeout: Duration,
    /// Participant must heartbeat within this window. None disables the watchdog.
    pub heartbeat_timeout: Option<Duration>,
    pub retry: RetryPolicy,
    /// Drop the in-flight attempt when cancelled. When false, cancellation only
    /// prevents further retries and the current call runs to completion.
    pub abandon_on_cancel: bool,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            start_to_close_timeout: Duration::from_secs(120),
            schedule_to_start_timeout: Duration::from_secs(60),
            schedule_to_close_timeout: Duration::from_secs(180),
            heartbeat_timeout: Some(Duration::from_secs(30)),
            retry: RetryPolicy::default(),
            abandon_on_cancel: true,
        }
    }
}

impl ActivityOptions {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_start_to_close(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }

    pub fn with_schedule_to_close(mut self, timeout: Duration) -> Self {
        self.schedule_to_close_timeout = timeout;
        self
    }

    pub fn with_schedule_to_start(mut self, timeout: Duration) -> Self {
        self.schedule_to_start_timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, timeout: Option<Duration>) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_abandon_on_cancel(mut self, abandon: bool) -> Self {
        self.abandon_on_cancel = abandon;
        self
    }
}
