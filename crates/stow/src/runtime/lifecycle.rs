//! Container lifecycle state machine.

use std::fmt;

use serde::{Deserialize, Serialize};
use stow_common::{ContainerId, StowError, StowResult};

/// Container lifecycle states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// No namespace.
    #[default]
    Stopped,
    /// Namespace built, links mounted.
    Running,
    /// Removed; terminal.
    Destroyed,
}

/// Transitions between [`ContainerStatus`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Build the namespace.
    Start,
    /// Tear the namespace down.
    Stop,
    /// Remove the container.
    Destroy,
}

impl LifecycleEvent {
    const fn operation(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Destroy => "destroy",
        }
    }
}

impl ContainerStatus {
    /// The state `event` leads to, or [`StowError::InvalidState`].
    ///
    /// Destroying a running container is allowed; the caller stops it first.
    pub fn transition(self, id: &ContainerId, event: LifecycleEvent) -> StowResult<Self> {
        let next = match (self, event) {
            (Self::Stopped, LifecycleEvent::Start) => Self::Running,
            (Self::Running, LifecycleEvent::Stop) => Self::Stopped,
            (Self::Stopped | Self::Running, LifecycleEvent::Destroy) => Self::Destroyed,
            _ => {
                return Err(StowError::InvalidState {
                    id: id.to_string(),
                    state: self.to_string(),
                    operation: event.operation(),
                });
            }
        };
        Ok(next)
    }

    /// Whether configuration (root, binds) may still change.
    #[must_use]
    pub const fn is_configurable(self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_stop_cycle() {
        let id = ContainerId::new("a").unwrap();
        let status = ContainerStatus::Stopped;
        let status = status.transition(&id, LifecycleEvent::Start).unwrap();
        assert_eq!(status, ContainerStatus::Running);
        let status = status.transition(&id, LifecycleEvent::Stop).unwrap();
        assert_eq!(status, ContainerStatus::Stopped);
    }

    #[test]
    fn invalid_transitions() {
        let id = ContainerId::new("a").unwrap();
        assert!(ContainerStatus::Running.transition(&id, LifecycleEvent::Start).is_err());
        assert!(ContainerStatus::Stopped.transition(&id, LifecycleEvent::Stop).is_err());
        let err = ContainerStatus::Destroyed
            .transition(&id, LifecycleEvent::Start)
            .unwrap_err();
        assert!(err.to_string().contains("destroyed"));
        assert!(ContainerStatus::Destroyed.transition(&id, LifecycleEvent::Destroy).is_err());
    }

    #[test]
    fn destroy_from_any_live_state() {
        let id = ContainerId::new("a").unwrap();
        for status in [ContainerStatus::Stopped, ContainerStatus::Running] {
            assert_eq!(
                status.transition(&id, LifecycleEvent::Destroy).unwrap(),
                ContainerStatus::Destroyed
            );
        }
    }
}
