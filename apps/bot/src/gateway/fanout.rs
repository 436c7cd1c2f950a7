//! Broadcast hub for events that made it through the whole dispatch chain.
//!
//! A single `tokio::sync::broadcast` channel. Observers outside the handler
//! chain (metrics, bridges, tests) subscribe and filter locally.

use std::sync::Arc;

use tokio::sync::broadcast;

use super::dispatcher::EventContext;

/// Slow receivers that fall behind skip events (`RecvError::Lagged`).
const BROADCAST_CAPACITY: usize = 4096;

/// Cloneable; store in AppState.
#[derive(Clone)]
pub struct EventFanout {
    sender: broadcast::Sender<Arc<EventContext>>,
}

impl EventFanout {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<EventContext>> {
        self.sender.subscribe()
    }

    /// Returns the number of receivers reached.
    pub fn publish(&self, event: Arc<EventContext>) -> usize {
        // No receivers is fine.
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for EventFanout {
    fn default() -> Self {
        Self::new()
    }
}
