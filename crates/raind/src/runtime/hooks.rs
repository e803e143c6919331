//! OCI hook ingestion.
//!
//! The runtime runs the hook helper at each lifecycle point; the helper posts
//! the OCI state document here and the container record follows it.

use std::sync::Arc;

use raind_common::RaindResult;
use raind_oci::{ContainerState, ContainerStatus, HookEvent};

use super::events::{ContainerEvent, EventBus, now};
use super::state::ContainerStore;

/// Applies hook deliveries to the container store.
#[derive(Debug, Clone)]
pub struct HookReceiver {
    store: Arc<ContainerStore>,
    events: EventBus,
}

impl HookReceiver {
    /// Create a receiver.
    pub const fn new(store: Arc<ContainerStore>, events: EventBus) -> Self {
        Self { store, events }
    }

    /// Apply one hook delivery.
    ///
    /// # Errors
    ///
    /// Returns [`raind_common::RaindError::NotFound`] for unknown containers
    /// and [`raind_common::RaindError::InvalidState`] for an edge the state
    /// machine rejects.
    pub fn handle(&self, event: HookEvent, state: &ContainerState) -> RaindResult<()> {
        let id = state.id.as_str();
        tracing::debug!(container_id = %id, event = %event, pid = ?state.pid, "Hook received");
        match event {
            HookEvent::CreateRuntime => {
                let record = self
                    .store
                    .transition(id, ContainerStatus::Created, state.pid)?;
                self.events.publish(ContainerEvent::Created {
                    id: id.to_string(),
                    pid: record.pid,
                    timestamp: now(),
                });
            }
            HookEvent::CreateContainer => {
                // Nothing to record; confirms the container is known.
                self.store.get(id)?;
            }
            HookEvent::Poststart => {
                self.store.transition(id, ContainerStatus::Running, None)?;
                self.events.publish(ContainerEvent::Started {
                    id: id.to_string(),
                    timestamp: now(),
                });
            }
            HookEvent::StopContainer => {
                self.store.update(id, |record| {
                    record.transition(ContainerStatus::Stopped, Some(0))?;
                    record.reason = Some("stopped".to_string());
                    Ok(())
                })?;
                self.events.publish(ContainerEvent::Stopped {
                    id: id.to_string(),
                    reason: "stopped".to_string(),
                    timestamp: now(),
                });
            }
            HookEvent::Poststop => {
                if self.store.remove(id)?.is_some() {
                    tracing::info!(container_id = %id, "Container removed after poststop");
                    self.events.publish(ContainerEvent::Deleted {
                        id: id.to_string(),
                        timestamp: now(),
                    });
                }
            }
        }
        Ok(())
    }
}
