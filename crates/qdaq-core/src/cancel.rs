//! Cooperative cancellation for long-running procedures.
//!
//! A [`CancelToken`] is cloned into whatever may request an interrupt (a signal
//! handler, a UI, a test) and checked by the sweep between steps. Waits inside a
//! step are never cut short; the step boundary is the unit of interruption.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable cancellation flag backed by a watch channel.
#[derive(Debug, Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// True once `cancel()` was called on any clone.
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.sender.subscribe();
        // The sender lives in `self`, so `wait_for` only fails if it is dropped.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}
