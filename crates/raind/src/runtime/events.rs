//! Container event definitions and bus.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Container lifecycle events.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ContainerEvent {
    /// Create accepted.
    Creating { id: String, timestamp: i64 },
    /// Runtime environment created.
    Created { id: String, pid: u32, timestamp: i64 },
    /// Process started.
    Started { id: String, timestamp: i64 },
    /// Process stopped or vanished.
    Stopped { id: String, reason: String, timestamp: i64 },
    /// Container deleted.
    Deleted { id: String, timestamp: i64 },
}

impl ContainerEvent {
    /// Id of the container the event is about.
    #[must_use]
    pub fn container_id(&self) -> &str {
        match self {
            Self::Creating { id, .. }
            | Self::Created { id, .. }
            | Self::Started { id, .. }
            | Self::Stopped { id, .. }
            | Self::Deleted { id, .. } => id,
        }
    }
}

/// Current time for event stamps.
#[must_use]
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Event bus for container events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ContainerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }
}

impl EventBus {
    /// Create a new event bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ContainerEvent> {
        self.sender.subscribe()
    }

    /// Publish an event.
    pub fn publish(&self, event: ContainerEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(ContainerEvent::Started {
            id: "abc".to_string(),
            timestamp: now(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.container_id(), "abc");
    }

    #[test]
    fn publish_without_subscribers() {
        EventBus::new().publish(ContainerEvent::Deleted {
            id: "abc".to_string(),
            timestamp: 0,
        });
    }
}
