//! Dispatch event bus.
//!
//! Uses a [`tokio::sync::broadcast`] channel so every subscriber (the CLI, a
//! service layer, tests) sees every [`DispatchEvent`] without a slow
//! subscriber blocking the dispatcher.  Publishing with nobody listening is
//! the normal case and is not an error.

use posture_types::{DispatchEvent, DispatchPayload};
use tokio::sync::broadcast;
use tracing::trace;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
pub const DEFAULT_CAPACITY: usize = 256;

/// Shared dispatch event bus. Clones share the same channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<DispatchEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Stamp `payload` and publish it.
    ///
    /// Returns the number of subscribers that were handed the event.
    pub fn publish(&self, payload: DispatchPayload) -> usize {
        let event = DispatchEvent::new(payload);
        match self.sender.send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(event)) => {
                trace!(event_id = %event.id, "no dispatch event subscribers");
                0
            }
        }
    }

    /// Subscribe to every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
