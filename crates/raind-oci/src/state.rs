//! Container state management.
//!
//! [`ContainerState`] is the OCI state document the runtime hands to lifecycle
//! hooks on stdin. [`ContainerStatus`] is raind's own state machine for a
//! container record.

use std::collections::HashMap;
use std::path::PathBuf;

use raind_common::{RaindError, RaindResult};
use serde::{Deserialize, Serialize};

/// OCI container state as delivered to hooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    /// OCI version.
    #[serde(default)]
    pub oci_version: String,
    /// Container ID.
    pub id: String,
    /// Runtime-reported status.
    pub status: ContainerStatus,
    /// Process ID of the container init process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Path to the bundle.
    #[serde(default)]
    pub bundle: PathBuf,
    /// Annotations.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl ContainerState {
    /// State for a container that is being created.
    #[must_use]
    pub fn new(id: impl Into<String>, bundle: impl Into<PathBuf>) -> Self {
        Self {
            oci_version: crate::OCI_VERSION.to_string(),
            id: id.into(),
            status: ContainerStatus::Creating,
            pid: None,
            bundle: bundle.into(),
            annotations: HashMap::new(),
        }
    }
}

/// Container lifecycle states.
///
/// Legal edges:
///
/// | From | To | Cause |
/// |---|---|---|
/// | creating | created | `createRuntime` hook |
/// | created | running | start |
/// | created, running | stopped | stop hook or vanished init process |
/// | stopped | created | recreate before restart |
/// | stopped | running | restart |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container is being created.
    Creating,
    /// Container has been created but not started.
    Created,
    /// Container is running.
    Running,
    /// Container has exited.
    Stopped,
}

impl ContainerStatus {
    /// Returns true if the container can be started.
    #[must_use]
    pub const fn can_start(&self) -> bool {
        matches!(self, Self::Created | Self::Stopped)
    }

    /// Returns true if the container can be stopped.
    #[must_use]
    pub const fn can_stop(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns true if the container can be deleted.
    #[must_use]
    pub const fn can_delete(&self) -> bool {
        matches!(self, Self::Creating | Self::Created | Self::Stopped)
    }

    /// Returns true if a process can be executed inside the container.
    #[must_use]
    pub const fn can_exec(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns true if the container is in a running state.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns true if the container has an init process the monitor should
    /// watch.
    #[must_use]
    pub const fn has_process(&self) -> bool {
        matches!(self, Self::Created | Self::Running)
    }

    /// Returns true if the edge `self -> next` is legal. Staying in the same
    /// state is always legal so repeated hook deliveries are harmless.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Creating, Self::Creating | Self::Created)
                | (Self::Created, Self::Created | Self::Running | Self::Stopped)
                | (Self::Running, Self::Running | Self::Stopped)
                | (Self::Stopped, Self::Stopped | Self::Created | Self::Running)
        )
    }

    /// Validate and return the next state.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::InvalidState`] for an illegal edge.
    pub fn transition(self, id: &str, next: Self) -> RaindResult<Self> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(RaindError::InvalidState {
                kind: "container",
                id: id.to_string(),
                state: self.to_string(),
                operation: next.verb(),
            })
        }
    }

    const fn verb(self) -> &'static str {
        match self {
            Self::Creating => "begin creating",
            Self::Created => "become created",
            Self::Running => "become running",
            Self::Stopped => "become stopped",
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ContainerStatus; 4] = [
        ContainerStatus::Creating,
        ContainerStatus::Created,
        ContainerStatus::Running,
        ContainerStatus::Stopped,
    ];

    #[test]
    fn happy_path_transitions() {
        let state = ContainerStatus::Creating;
        let state = state.transition("c", ContainerStatus::Created).unwrap();
        let state = state.transition("c", ContainerStatus::Running).unwrap();
        let state = state.transition("c", ContainerStatus::Stopped).unwrap();
        assert_eq!(
            state.transition("c", ContainerStatus::Running).unwrap(),
            ContainerStatus::Running
        );
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let err = ContainerStatus::Creating
            .transition("c", ContainerStatus::Running)
            .unwrap_err();
        assert!(err.to_string().contains("creating"));
        assert!(
            ContainerStatus::Running
                .transition("c", ContainerStatus::Created)
                .is_err()
        );
        assert!(
            ContainerStatus::Stopped
                .transition("c", ContainerStatus::Creating)
                .is_err()
        );
    }

    #[test]
    fn every_state_is_idempotent() {
        for state in ALL {
            assert!(state.can_transition_to(state));
        }
    }

    #[test]
    fn operation_guards() {
        assert!(ContainerStatus::Created.can_start());
        assert!(ContainerStatus::Stopped.can_start());
        assert!(!ContainerStatus::Running.can_start());
        assert!(!ContainerStatus::Created.can_stop());
        assert!(!ContainerStatus::Running.can_delete());
        assert!(ContainerStatus::Creating.can_delete());
    }

    #[test]
    fn hook_payload_parses() {
        let json = r#"{"ociVersion":"1.2.0","id":"abc","status":"created","pid":42,"bundle":"/b"}"#;
        let state: ContainerState = serde_json::from_str(json).unwrap();
        assert_eq!(state.status, ContainerStatus::Created);
        assert_eq!(state.pid, Some(42));
    }

    #[test]
    fn status_display() {
        assert_eq!(ContainerStatus::Creating.to_string(), "creating");
        assert_eq!(ContainerStatus::Running.to_string(), "running");
        assert_eq!(ContainerStatus::Stopped.to_string(), "stopped");
    }
}
