//! Container records.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use stow_common::{ContainerId, StowError, StowResult};

use super::lifecycle::{ContainerStatus, LifecycleEvent};
use crate::bind::BindSpec;
use crate::namespace::NamespaceMounts;

/// A container as far as mounts are concerned, persisted as `container.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    id: ContainerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    root: Option<PathBuf>,
    #[serde(default)]
    binds: Vec<BindSpec>,
    status: ContainerStatus,
    /// Mounts the running namespace owns, for teardown.
    #[serde(default)]
    mounts: NamespaceMounts,
}

impl Container {
    /// A stopped container with no root and no binds.
    #[must_use]
    pub fn new(id: ContainerId) -> Self {
        Self {
            id,
            root: None,
            binds: Vec::new(),
            status: ContainerStatus::Stopped,
            mounts: NamespaceMounts::default(),
        }
    }

    /// ID accessor.
    #[must_use]
    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Host path of the root, if chrooted.
    #[must_use]
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Bind specs in declared order.
    #[must_use]
    pub fn binds(&self) -> &[BindSpec] {
        &self.binds
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ContainerStatus {
        self.status
    }

    /// Mounts owned by the running namespace.
    #[must_use]
    pub fn mounts(&self) -> &NamespaceMounts {
        &self.mounts
    }

    /// Set or clear the root. Only while stopped.
    pub fn set_root(&mut self, root: Option<PathBuf>) -> StowResult<()> {
        self.ensure_configurable("set root")?;
        self.root = root;
        Ok(())
    }

    /// Replace the bind specs. Only while stopped.
    pub fn set_binds(&mut self, binds: Vec<BindSpec>) -> StowResult<()> {
        self.ensure_configurable("set binds")?;
        self.binds = binds;
        Ok(())
    }

    /// Move along the lifecycle.
    pub(crate) fn transition(&mut self, event: LifecycleEvent) -> StowResult<()> {
        self.status = self.status.transition(&self.id, event)?;
        Ok(())
    }

    /// Record the mounts of a freshly started namespace.
    pub(crate) fn set_mounts(&mut self, mounts: NamespaceMounts) {
        self.mounts = mounts;
    }

    /// Forget the namespace mounts, returning them.
    pub(crate) fn take_mounts(&mut self) -> NamespaceMounts {
        std::mem::take(&mut self.mounts)
    }

    /// Record a link mounted into the running namespace.
    pub(crate) fn mounts_mut(&mut self) -> &mut NamespaceMounts {
        &mut self.mounts
    }

    /// Reset a record left running by a previous process: its namespace is gone.
    pub(crate) fn mark_stale(&mut self) -> NamespaceMounts {
        self.status = ContainerStatus::Stopped;
        self.take_mounts()
    }

    fn ensure_configurable(&self, operation: &'static str) -> StowResult<()> {
        if self.status.is_configurable() {
            Ok(())
        } else {
            Err(StowError::InvalidState {
                id: self.id.to_string(),
                state: self.status.to_string(),
                operation,
            })
        }
    }
}
