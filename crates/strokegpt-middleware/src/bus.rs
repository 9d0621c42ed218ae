//! Broadcast bus for [`SessionEvent`]s.
//!
//! Uses a [`tokio::sync::broadcast`] channel so that the discovery window,
//! the removal watcher and any diagnostic listener each see every event
//! without blocking one another.

use tokio::sync::broadcast;
use tracing::debug;

use crate::adapter::SessionEvent;

/// Default channel capacity (events buffered before slow subscribers lag).
const DEFAULT_CAPACITY: usize = 64;

/// Cheaply cloneable handle; all clones share one channel.
#[derive(Clone, Debug)]
pub struct SessionBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl SessionBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish `event` and return the number of subscribers that got it.
    ///
    /// Having no subscribers is normal between discovery windows and is
    /// reported as `0`, not as an error.
    pub fn publish(&self, event: SessionEvent) -> usize {
        match self.sender.send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(event)) => {
                debug!(?event, "session event dropped: no subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }
}

impl Default for SessionBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
