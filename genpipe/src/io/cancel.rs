//! Cooperative cancellation shared between the orchestrator and child processes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::warn;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    reason: RwLock<Option<String>>,
}

/// Cloneable cancellation flag. Only the first reason is kept.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, reason: impl Into<String>) {
        // The reason is stored before the flag flips, so observers always see it.
        let mut slot = self.inner.reason.write();
        if slot.is_some() {
            return;
        }
        let reason = reason.into();
        warn!(%reason, "cancellation requested");
        *slot = Some(reason);
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Reason given to the first `cancel` call, if cancelled.
    pub fn reason(&self) -> Option<String> {
        if !self.is_cancelled() {
            return None;
        }
        self.inner.reason.read().clone()
    }
}
