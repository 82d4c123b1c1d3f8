//! Activity Runtime
//!
//! Executes exactly one participant operation under a policy (timeouts, retry,
//! heartbeat) and reports a single final outcome to the saga engine.
//!
//! ```text
//!   schedule ──► [wait for worker slot] ──► attempt ──► ok ───────────────► Completed
//!      │         schedule_to_start          │  start_to_close / heartbeat
//!      │                                    ├─ non-retryable ────────────► Failed(Permanent)
//!      │                                    └─ retryable ─► backoff ─► attempt ...
//!      └──────────────── schedule_to_close bounds the whole loop ─────────► Failed(TimedOut)
//! ```

pub mod policy;
pub mod runtime;

pub use policy::{ActivityOptions, RetryPolicy};
pub use runtime::{
    ActivityFailure, ActivityOutcome, ActivityRuntime, AttemptContext, AttemptOutcome,
    AttemptRecorder, AttemptReport, FailureKind,
};

use std::sync::Arc;

use tokio::sync::watch;

/// Liveness handle passed to a participant for the duration of one attempt
///
/// Every `beat()` resets the attempt's heartbeat window.
#[derive(Clone)]
pub struct Heartbeat {
    tx: Arc<watch::Sender<u64>>,
}

impl Heartbeat {
    pub(crate) fn channel() -> (Self, watch::Receiver<u64>) {
        let (tx, rx) = watch::channel(0);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// A heartbeat nobody watches, for calls made outside the runtime
    pub fn detached() -> Self {
        Self::channel().0
    }

    /// Record progress
    pub fn beat(&self) {
        self.tx.send_modify(|n| *n = n.wrapping_add(1));
    }
}

/// Sender half of a cancellation signal
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Raise the signal. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Cooperative cancellation observed by the runtime
#[derive(Clone)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    pub fn channel() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelSignal { rx: Some(rx) })
    }

    /// A signal that never fires
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once the signal is raised; pends forever otherwise
    pub async fn cancelled(&self) {
        let Some(rx) = &self.rx else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Handle dropped without cancelling
                return std::future::pending().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_signal_fires() {
        let (handle, signal) = CancelSignal::channel();
        assert!(!signal.is_cancelled());

        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.cancelled().await }
        });
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(signal.is_cancelled());
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_never_signal_pends() {
        let signal = CancelSignal::never();
        let r = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(r.is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_notifies() {
        let (hb, mut rx) = Heartbeat::channel();
        hb.beat();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }
}
