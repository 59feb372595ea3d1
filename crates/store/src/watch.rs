use thiserror::Error;
use tokio::sync::broadcast;

use crate::StoreEvent;

/// Errors surfaced by a [`StoreWatcher`].
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum WatchError {
    /// The subscriber fell behind and `0` events were dropped. Callers should
    /// resynchronise from the store before consuming further events.
    #[error("watcher lagged, {0} events skipped")]
    Lagged(u64),

    /// The store was dropped.
    #[error("store closed")]
    Closed,
}

/// Subscription to committed mutations under one scope.
///
/// Events arrive in commit order with keys relative to the scope the watcher
/// was created from.
#[derive(Debug)]
pub struct StoreWatcher {
    receiver: broadcast::Receiver<StoreEvent>,
    prefix: String,
}

impl StoreWatcher {
    /// Create a watcher over a backend's event channel. `prefix` is the full
    /// key prefix of the scope; events outside of it are skipped.
    #[must_use]
    pub fn new(receiver: broadcast::Receiver<StoreEvent>, prefix: impl Into<String>) -> Self {
        Self {
            receiver,
            prefix: prefix.into(),
        }
    }

    /// Wait for the next event in scope.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Lagged`] if events were dropped and
    /// [`WatchError::Closed`] once the store is gone.
    pub async fn recv(&mut self) -> Result<StoreEvent, WatchError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if let Some(event) = event.strip_prefix(&self.prefix) {
                        return Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Err(WatchError::Lagged(skipped));
                }
                Err(broadcast::error::RecvError::Closed) => return Err(WatchError::Closed),
            }
        }
    }
}
