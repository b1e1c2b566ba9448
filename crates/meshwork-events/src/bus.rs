//! Bounded broadcast bus for mesh events.

use tokio::sync::broadcast;
use tracing::debug;

use crate::event::MeshEvent;

/// Buffered events per subscriber before lagging receivers drop.
pub const EVENT_BUFFER: usize = 256;

/// Fan-out channel for [`MeshEvent`]s.
///
/// Publishing never blocks and never fails: with no subscribers the event
/// is dropped, and a subscriber that falls behind loses the oldest
/// buffered events rather than back-pressuring the mesh.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MeshEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: MeshEvent) {
        match self.sender.send(event) {
            Ok(receivers) => debug!(receivers, "mesh event published"),
            Err(broadcast::error::SendError(event)) => {
                debug!(kind = event.kind(), "mesh event dropped (no subscribers)");
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_BUFFER)
    }
}
