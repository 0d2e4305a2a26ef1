//! One cancellable delayed action per owner.
//!
//! Consolidates the scattered debounce/cleanup/stuck-detection timers into
//! a single abstraction: scheduling replaces any pending action, and
//! cancellation is one idempotent call that never fails.

use std::future::Future;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};

/// A single pending delayed action. Dropping the timer cancels it.
#[derive(Debug, Default)]
pub struct CancellableTimer {
    handle: Option<JoinHandle<()>>,
}

impl CancellableTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `action` to run after `delay`, replacing any pending action.
    pub fn schedule<F>(&mut self, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.handle = Some(tokio::spawn(async move {
            sleep(delay).await;
            action.await;
        }));
    }

    /// Cancel the pending action. Safe to call any number of times,
    /// including when nothing is pending.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Whether an action is still scheduled or running.
    pub fn is_pending(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for CancellableTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ─── Tests ────────────────────────────────────────────────────────
