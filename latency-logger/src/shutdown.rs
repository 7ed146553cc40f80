//! The process-wide shutdown signal.
//!
//! A [`ShutdownSignal`] is a one-shot broadcast "stop": once triggered it stays triggered for the
//! lifetime of the process. Every clone observes the same state, so the signal can be handed to
//! the scheduler, each worker, and the signal handler.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// A one-shot, never-reset stop signal shared by every unit of the monitor.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
    triggered: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// Creates a new, untriggered, signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests shutdown.
    ///
    /// Returns `true` only for the call which actually set the signal. Subsequent calls are
    /// no-ops and return `false`.
    pub fn trigger(&self) -> bool {
        let first = !self.triggered.swap(true, Ordering::AcqRel);
        self.token.cancel();
        first
    }

    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once shutdown has been requested.
    ///
    /// Completes immediately if the signal was already triggered.
    pub fn triggered(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}
