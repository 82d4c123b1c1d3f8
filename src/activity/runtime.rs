//! Activity execution: worker slots, per-attempt timeouts, heartbeat watchdog,
//! retry with backoff, and cooperative cancellation.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, warn};

use super::{ActivityOptions, CancelSignal, Heartbeat};
use crate::ledger::LedgerError;
use crate::metrics::SagaMetrics;
use crate::transfer::TransferError;

/// Outcome of a single attempt, as persisted in the saga step log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Ok,
    Retried,
    FailedRetryable,
    FailedPermanent,
    TimedOut,
    Cancelled,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Ok => "ok",
            AttemptOutcome::Retried => "retried",
            AttemptOutcome::FailedRetryable => "failed_retryable",
            AttemptOutcome::FailedPermanent => "failed_permanent",
            AttemptOutcome::TimedOut => "timed_out",
            AttemptOutcome::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One finished attempt, handed to the recorder before the runtime moves on
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub activity: &'static str,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub error_code: Option<String>,
    pub error: Option<String>,
}

/// Durable sink for attempt reports
///
/// A recorder error aborts the activity: nothing proceeds past an attempt that
/// was not persisted.
#[async_trait]
pub trait AttemptRecorder: Send + Sync {
    async fn record(&self, report: &AttemptReport) -> Result<(), TransferError>;
}

/// Passed to the operation on each attempt
pub struct AttemptContext {
    pub attempt: u32,
    pub heartbeat: Heartbeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Non-retryable error code
    Permanent,
    /// max_attempts reached with retryable errors
    RetriesExhausted,
    /// schedule_to_close budget spent
    TimedOut,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::Permanent => "permanent failure",
            FailureKind::RetriesExhausted => "retries exhausted",
            FailureKind::TimedOut => "timed out",
            FailureKind::Cancelled => "cancelled",
        })
    }
}

/// Final failure of an activity
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{activity} {kind} after {attempts} attempt(s): {message}")]
pub struct ActivityFailure {
    pub activity: &'static str,
    pub kind: FailureKind,
    /// Participant error code of the last failed attempt, if any
    pub code: Option<String>,
    pub message: String,
    pub attempts: u32,
    pub elapsed: Duration,
    /// Participant error of the last failed attempt
    pub source_error: Option<LedgerError>,
}

/// Single final outcome of an activity
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityOutcome<T> {
    Completed(T),
    Failed(ActivityFailure),
}

enum AttemptResult<T> {
    Ok(T),
    Err(LedgerError),
    TimedOut(&'static str),
    Cancelled,
}

/// Shared executor for participant calls
pub struct ActivityRuntime {
    slots: Arc<Semaphore>,
    metrics: Arc<SagaMetrics>,
}

impl ActivityRuntime {
    pub const DEFAULT_MAX_CONCURRENT: usize = 256;

    pub fn new(max_concurrent: usize, metrics: Arc<SagaMetrics>) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
            metrics,
        }
    }

    /// Run `op` under `options` until it succeeds or reaches a final failure
    ///
    /// Every attempt is passed to `recorder` before the next one is scheduled.
    /// `Err` is returned only when the recorder itself fails.
    pub async fn execute<T, F, Fut>(
        &self,
        activity: &'static str,
        options: &ActivityOptions,
        cancel: &CancelSignal,
        recorder: &dyn AttemptRecorder,
        mut op: F,
    ) -> Result<ActivityOutcome<T>, TransferError>
    where
        F: FnMut(AttemptContext) -> Fut + Send,
        Fut: Future<Output = Result<T, LedgerError>> + Send,
        T: Send,
    {
        let started = Instant::now();
        let deadline = started + options.schedule_to_close_timeout;
        let policy = &options.retry;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let attempt_started_at = Utc::now();
            let attempt_clock = Instant::now();

            let result = self
                .run_attempt(attempt, deadline, options, cancel, &mut op)
                .await;

            self.metrics
                .observe_step_latency(activity, attempt_clock.elapsed());

            let fail = |kind, code: Option<String>, message: String, err: Option<LedgerError>| {
                ActivityFailure {
                    activity,
                    kind,
                    code,
                    message,
                    attempts: attempt,
                    elapsed: started.elapsed(),
                    source_error: err,
                }
            };

            let (code, message, err) = match result {
                AttemptResult::Ok(value) => {
                    self.report(
                        recorder,
                        activity,
                        attempt,
                        attempt_started_at,
                        AttemptOutcome::Ok,
                        None,
                        None,
                    )
                    .await?;
                    return Ok(ActivityOutcome::Completed(value));
                }
                AttemptResult::Cancelled => {
                    self.report(
                        recorder,
                        activity,
                        attempt,
                        attempt_started_at,
                        AttemptOutcome::Cancelled,
                        None,
                        Some("cancelled".to_string()),
                    )
                    .await?;
                    return Ok(ActivityOutcome::Failed(fail(
                        FailureKind::Cancelled,
                        None,
                        "cancelled".to_string(),
                        None,
                    )));
                }
                AttemptResult::Err(e) if policy.is_non_retryable(e.code()) => {
                    let code = e.code().to_string();
                    let message = e.to_string();
                    self.report(
                        recorder,
                        activity,
                        attempt,
                        attempt_started_at,
                        AttemptOutcome::FailedPermanent,
                        Some(code.clone()),
                        Some(message.clone()),
                    )
                    .await?;
                    return Ok(ActivityOutcome::Failed(fail(
                        FailureKind::Permanent,
                        Some(code),
                        message,
                        Some(e),
                    )));
                }
                AttemptResult::Err(e) => (Some(e.code().to_string()), e.to_string(), Some(e)),
                AttemptResult::TimedOut(which) => {
                    (None, format!("{} timeout exceeded", which), None)
                }
            };

            // Retryable failure: deadline first, then attempts, then back off
            let delay = policy.delay_for(attempt);
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (outcome, terminal_kind) = if remaining.is_zero() || delay >= remaining {
                (AttemptOutcome::TimedOut, Some(FailureKind::TimedOut))
            } else if policy.is_exhausted(attempt) {
                (
                    AttemptOutcome::FailedRetryable,
                    Some(FailureKind::RetriesExhausted),
                )
            } else {
                (AttemptOutcome::Retried, None)
            };

            self.report(
                recorder,
                activity,
                attempt,
                attempt_started_at,
                outcome,
                code.clone(),
                Some(message.clone()),
            )
            .await?;

            if let Some(kind) = terminal_kind {
                warn!(activity, attempt, kind = %kind, error = %message, "Activity failed");
                return Ok(ActivityOutcome::Failed(fail(kind, code, message, err)));
            }

            debug!(activity, attempt, delay_ms = delay.as_millis() as u64, error = %message, "Retrying activity");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return Ok(ActivityOutcome::Failed(fail(
                        FailureKind::Cancelled,
                        code,
                        format!("cancelled during backoff after: {}", message),
                        err,
                    )));
                }
            }
        }
    }

    async fn run_attempt<T, F, Fut>(
        &self,
        attempt: u32,
        deadline: Instant,
        options: &ActivityOptions,
        cancel: &CancelSignal,
        op: &mut F,
    ) -> AttemptResult<T>
    where
        F: FnMut(AttemptContext) -> Fut + Send,
        Fut: Future<Output = Result<T, LedgerError>> + Send,
    {
        if cancel.is_cancelled() {
            return AttemptResult::Cancelled;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let queue_wait = options.schedule_to_start_timeout.min(remaining);
        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => return AttemptResult::Cancelled,
            r = tokio::time::timeout(queue_wait, self.slots.clone().acquire_owned()) => r,
        };
        let _permit = match acquired {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return AttemptResult::Err(LedgerError::Transient(
                    "activity worker pool closed".to_string(),
                ));
            }
            Err(_) => return AttemptResult::TimedOut("schedule_to_start"),
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        let budget = options.start_to_close_timeout.min(remaining);
        let which = if budget < options.start_to_close_timeout {
            "schedule_to_close"
        } else {
            "start_to_close"
        };

        let (heartbeat, beats) = Heartbeat::channel();
        let call = tokio::time::timeout(budget, op(AttemptContext { attempt, heartbeat }));
        tokio::pin!(call);
        let watchdog = heartbeat_watchdog(beats, options.heartbeat_timeout);
        tokio::pin!(watchdog);

        let result = if options.abandon_on_cancel {
            tokio::select! {
                r = &mut call => r,
                _ = &mut watchdog => return AttemptResult::TimedOut("heartbeat"),
                _ = cancel.cancelled() => return AttemptResult::Cancelled,
            }
        } else {
            tokio::select! {
                r = &mut call => r,
                _ = &mut watchdog => return AttemptResult::TimedOut("heartbeat"),
            }
        };

        match result {
            Ok(Ok(value)) => AttemptResult::Ok(value),
            Ok(Err(e)) => AttemptResult::Err(e),
            Err(_) => AttemptResult::TimedOut(which),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn report(
        &self,
        recorder: &dyn AttemptRecorder,
        activity: &'static str,
        attempt: u32,
        started_at: DateTime<Utc>,
        outcome: AttemptOutcome,
        error_code: Option<String>,
        error: Option<String>,
    ) -> Result<(), TransferError> {
        self.metrics.attempt(activity, outcome);
        recorder
            .record(&AttemptReport {
                activity,
                attempt,
                started_at,
                ended_at: Utc::now(),
                outcome,
                error_code,
                error,
            })
            .await
    }
}

/// Resolves when no beat arrives within `window`
async fn heartbeat_watchdog(mut beats: watch::Receiver<u64>, window: Option<Duration>) {
    let Some(window) = window else {
        return std::future::pending().await;
    };
    loop {
        match tokio::time::timeout(window, beats.changed()).await {
            Ok(Ok(())) => continue,
            // Operation finished and dropped its heartbeat
            Ok(Err(_)) => return std::future::pending().await,
            Err(_) => return,
        }
    }
}
