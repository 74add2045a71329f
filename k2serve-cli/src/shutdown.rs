//! Process-wide shutdown latch.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// One-shot latch that triggers the graceful transport stop.
///
/// Fired by the remote-shutdown RPC or a termination signal; firing is
/// idempotent and can never be undone.
#[derive(Debug, Default)]
pub struct ShutdownLatch {
    fired: AtomicBool,
    notify: Notify,
}

impl ShutdownLatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the latch, waking every current and future waiter.
    pub fn fire(&self) {
        self.fired.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Resolve once the latch has fired.
    pub async fn wait(&self) {
        while !self.is_fired() {
            let notified = self.notify.notified();
            // Re-check after registering so a fire between the check and
            // the registration is not lost.
            if self.is_fired() {
                break;
            }
            notified.await;
        }
    }
}
