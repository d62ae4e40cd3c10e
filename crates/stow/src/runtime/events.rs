//! Runtime event definitions and bus.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Runtime event types.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeEvent {
    /// Volume mounted at its path.
    VolumeCreated {
        id: String,
        path: String,
        timestamp: i64,
    },
    /// Volume unmounted and removed.
    VolumeDestroyed { id: String, timestamp: i64 },
    /// Container namespace built.
    ContainerStarted { id: String, timestamp: i64 },
    /// Container namespace torn down.
    ContainerStopped { id: String, timestamp: i64 },
    /// Container removed.
    ContainerDestroyed { id: String, timestamp: i64 },
    /// Link materialized.
    LinkMounted {
        volume: String,
        container: String,
        target: String,
        timestamp: i64,
    },
    /// Link materialization removed.
    LinkUnmounted {
        volume: String,
        container: String,
        target: String,
        timestamp: i64,
    },
}

/// Event bus for runtime events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RuntimeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }
}

impl EventBus {
    /// Create a new event bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    /// Publish an event.
    pub fn publish(&self, event: RuntimeEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

/// Seconds since the epoch, for event timestamps.
pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
