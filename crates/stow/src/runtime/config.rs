//! Runtime configuration.

use std::path::PathBuf;
use std::sync::Arc;

use stow_common::{StowPaths, StowResult};

use super::events::EventBus;
use crate::bind::{BindResolver, MAX_SYMLINKS};
use crate::mount::Mounter;
use crate::propagation::PropagationGraph;

/// Which mount backend the runtime drives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MountBackend {
    /// Real mount syscalls.
    #[default]
    Kernel,
    /// The in-memory propagation model.
    Simulated,
}

/// Runtime configuration options.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Paths for volume and container data.
    pub paths: StowPaths,
    /// Mount backend.
    pub backend: MountBackend,
    /// Symlinks followed when resolving a path inside a root.
    pub symlink_limit: usize,
    /// Event bus for runtime events.
    pub event_bus: EventBus,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            paths: StowPaths::new(),
            backend: MountBackend::Kernel,
            symlink_limit: MAX_SYMLINKS,
            event_bus: EventBus::new(),
        }
    }
}

impl RuntimeConfig {
    /// Set the root directory. The runtime directory moves below it.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths = StowPaths::with_root(root);
        self
    }

    /// Set the runtime directory.
    #[must_use]
    pub fn with_runtime_dir(mut self, runtime: impl Into<PathBuf>) -> Self {
        self.paths.runtime = runtime.into();
        self
    }

    /// Drive the in-memory model instead of the kernel.
    #[must_use]
    pub fn simulated(mut self) -> Self {
        self.backend = MountBackend::Simulated;
        self
    }

    /// Set the symlink limit for path resolution.
    #[must_use]
    pub fn with_symlink_limit(mut self, limit: usize) -> Self {
        self.symlink_limit = limit;
        self
    }

    /// The resolver configured by this config.
    #[must_use]
    pub fn resolver(&self) -> BindResolver {
        BindResolver::new(self.symlink_limit)
    }

    /// Instantiate the configured mount backend.
    pub fn mounter(&self) -> StowResult<Arc<dyn Mounter>> {
        match self.backend {
            MountBackend::Simulated => Ok(Arc::new(PropagationGraph::new())),
            #[cfg(target_os = "linux")]
            MountBackend::Kernel => Ok(Arc::new(crate::mount::KernelMounter::new())),
            #[cfg(not(target_os = "linux"))]
            MountBackend::Kernel => Err(stow_common::StowError::Unsupported {
                feature: "kernel mount backend".to_string(),
            }),
        }
    }
}
