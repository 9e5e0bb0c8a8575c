//! Publish/subscribe channel for hub events.
//!
//! Every component publishes [`HubEvent`]s through a shared [`EventBus`].
//! UI and WebUI layers subscribe independently and each receives the full
//! stream.

use protocol::HubEvent;
use tokio::sync::broadcast;

/// Default channel capacity for event subscribers.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Cloneable handle to the hub's broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HubEvent>,
}

impl EventBus {
    /// Creates a bus with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY)
    }

    /// Creates a bus with a specific per-subscriber buffer.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn publish(&self, event: HubEvent) {
        let _ = self.tx.send(event);
    }

    /// Registers a new subscriber that sees events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
