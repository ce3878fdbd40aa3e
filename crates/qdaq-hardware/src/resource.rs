//! Exclusive instrument sessions.
//!
//! Every registered instrument carries a `tokio::sync::Mutex<()>`. A sweep
//! takes all of its instruments at once with
//! [`crate::InstrumentRegistry::acquire_exclusive`] and holds the returned
//! [`ExclusiveSession`] for its whole lifetime; a second sweep asking for any
//! held instrument fails immediately instead of queueing behind the first.

use tokio::sync::OwnedMutexGuard;
use tracing::debug;

/// Owned guards on a set of instruments. Released on drop.
#[derive(Debug)]
pub struct ExclusiveSession {
    guards: Vec<(String, OwnedMutexGuard<()>)>,
}

impl ExclusiveSession {
    pub(crate) fn new(guards: Vec<(String, OwnedMutexGuard<()>)>) -> Self {
        debug!(
            instruments = ?guards.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(),
            "Acquired exclusive session"
        );
        Self { guards }
    }

    /// Held instrument ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        self.guards.iter().map(|(id, _)| id.as_str()).collect()
    }

    /// True if the session holds `id`.
    pub fn holds(&self, id: &str) -> bool {
        self.guards.iter().any(|(held, _)| held == id)
    }

    /// Number of held instruments.
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    /// True when no instrument is held.
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

impl Drop for ExclusiveSession {
    fn drop(&mut self) {
        if !self.guards.is_empty() {
            debug!(count = self.guards.len(), "Released exclusive session");
        }
    }
}
