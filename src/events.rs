// Publish/subscribe notifications for presentation layers

use log::trace;
use tokio::sync::broadcast;

use crate::models::{ConnectionState, Message};
use crate::offline::OfflineReason;
use crate::sync::SyncReport;

#[derive(Debug, Clone, PartialEq)]
pub enum MessengerEvent {
    OfflineModeChanged { enabled: bool, reason: OfflineReason },
    StateChanged(ConnectionState),
    MessageAdded(Message),
    SyncCompleted(SyncReport),
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MessengerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MessengerEvent> {
        self.tx.subscribe()
    }

    /// Deliver to current subscribers. Having none is not an error.
    pub fn publish(&self, event: MessengerEvent) {
        if self.tx.send(event).is_err() {
            trace!("No subscribers for messenger event");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
