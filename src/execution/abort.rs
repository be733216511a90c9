//! External abort requests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct AbortState {
    aborted: AtomicBool,
    notify: Notify,
}

/// Shared flag used to stop a run from outside (Ctrl-C, API caller)
///
/// The executor checks it at stage boundaries and between invocations, and
/// races every running invocation against [`AbortHandle::aborted`] so the
/// child process is killed instead of waited for.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    state: Arc<AbortState>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the run to stop; idempotent
    pub fn abort(&self) {
        if !self.state.aborted.swap(true, Ordering::SeqCst) {
            self.state.notify.notify_waiters();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.state.aborted.load(Ordering::SeqCst)
    }

    /// Resolves once an abort has been requested
    pub async fn aborted(&self) {
        let notified = self.state.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent abort is not missed
        notified.as_mut().enable();
        if self.is_aborted() {
            return;
        }
        notified.await;
    }
}
