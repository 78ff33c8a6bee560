use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Broadcasts cancellation to every task that registered interest, per the
/// "control token" described in the concurrency & resource model: socket
/// cancellation is forceful (linger off, shutdown both directions), and
/// in-flight storage operations suppress their completion callback once the
/// token fires.
#[derive(Clone)]
pub struct CancellationToken(Arc<State>);

struct State {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(State { cancelled: AtomicBool::new(false), notify: Notify::new() }))
    }

    pub fn cancel(&self) {
        if !self.0.cancelled.swap(true, Ordering::SeqCst) {
            // notify_waiters only wakes tasks already polling `cancelled()`;
            // any task starting after this still observes `is_cancelled`.
            self.0.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`Self::cancel`] has been called. Safe to await
    /// repeatedly and from multiple clones.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            let notified = self.0.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
            if self.is_cancelled() {
                return;
            }
        }
    }

    /// Sleeps for `duration` unless cancelled first, in 50ms poll slices per
    /// the design note replacing thread-based `interruptibleSleep`. Returns
    /// `false` if cancellation interrupted the sleep.
    pub async fn sleep_cancellable(&self, duration: Duration) -> bool {
        const SLICE: Duration = Duration::from_millis(50);
        let mut remaining = duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let step = remaining.min(SLICE);
            tokio::select! {
                _ = tokio::time::sleep(step) => {}
                _ = self.cancelled() => return false,
            }
            if step >= remaining {
                return !self.is_cancelled();
            }
            remaining -= step;
        }
    }

    /// A token derived from this one: cancelling the child does not cancel
    /// the parent, but cancelling the parent also cancels every child. Used
    /// to scope cancellation to a single connection within a pipeline whose
    /// top-level token belongs to the owning queue.
    pub fn child_token(&self) -> Self {
        let child = Self::new();
        let parent = self.clone();
        let child_clone = child.clone();
        tokio::spawn(async move {
            parent.cancelled().await;
            child_clone.cancel();
        });
        child
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
