//! Common error types for the stow subsystem.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`StowError`].
pub type StowResult<T> = Result<T, StowError>;

/// Errors raised by volume and mount-namespace operations.
#[derive(Error, Diagnostic, Debug)]
pub enum StowError {
    /// Invalid backend/storage/layer combination, rejected before any mount call.
    #[error("Invalid {backend} volume configuration: {message}")]
    #[diagnostic(
        code(stow::volume::backend_config),
        help("bind and rbind need storage=<dir>, overlay needs at least one layer")
    )]
    BackendConfig {
        /// Backend name.
        backend: String,
        /// What is wrong with the request.
        message: String,
    },

    /// Something is already mounted at the requested path.
    #[error("Path already mounted: {}", path.display())]
    #[diagnostic(code(stow::mount::path_conflict))]
    PathConflict {
        /// The conflicting mount point.
        path: PathBuf,
    },

    /// A symlink chain could not be resolved inside its root.
    #[error("Cannot resolve {}: {reason}", path.display())]
    #[diagnostic(code(stow::bind::symlink))]
    SymlinkResolution {
        /// The path being resolved.
        path: PathBuf,
        /// Why resolution stopped.
        reason: String,
    },

    /// Unmount refused because the mount is still referenced.
    #[error("Mount busy: {}", path.display())]
    #[diagnostic(code(stow::mount::busy))]
    MountBusy {
        /// The busy mount point.
        path: PathBuf,
    },

    /// A mount syscall failed.
    #[error("{operation} {} failed: {source}", path.display())]
    #[diagnostic(code(stow::mount::syscall))]
    MountSyscall {
        /// The mount operation (bind, remount, umount, ...).
        operation: &'static str,
        /// Target of the operation.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Container not found.
    #[error("Container not found: {id}")]
    #[diagnostic(code(stow::container::not_found))]
    ContainerNotFound {
        /// The container ID that was not found.
        id: String,
    },

    /// Volume not found.
    #[error("Volume not found: {id}")]
    #[diagnostic(code(stow::volume::not_found))]
    VolumeNotFound {
        /// Volume id or path.
        id: String,
    },

    /// No link between the volume and container.
    #[error("Volume {volume} is not linked to {container}")]
    #[diagnostic(code(stow::link::not_found))]
    LinkNotFound {
        /// Volume id.
        volume: String,
        /// Container id.
        container: String,
    },

    /// The same link already exists.
    #[error("Volume {volume} already linked to {container} at {}", target.display())]
    #[diagnostic(code(stow::link::exists))]
    LinkExists {
        /// Volume id.
        volume: String,
        /// Container id.
        container: String,
        /// Link target.
        target: PathBuf,
    },

    /// Invalid container ID format.
    #[error("Invalid container ID: {id}")]
    #[diagnostic(
        code(stow::container::invalid_id),
        help("Container IDs must be alphanumeric with hyphens and underscores, 1-64 characters")
    )]
    InvalidContainerId {
        /// The invalid container ID.
        id: String,
    },

    /// Malformed bind specification.
    #[error("Invalid bind specification '{spec}': {reason}")]
    #[diagnostic(
        code(stow::bind::invalid_spec),
        help("Use '<source> <target> [ro|rw|rec,...]' entries separated by ';'")
    )]
    InvalidBindSpec {
        /// The offending entry.
        spec: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Operation not allowed in the current lifecycle state.
    #[error("Cannot {operation} container {id} in state {state}")]
    #[diagnostic(code(stow::container::invalid_state))]
    InvalidState {
        /// Container id.
        id: String,
        /// Current state.
        state: String,
        /// Attempted operation.
        operation: &'static str,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(stow::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(stow::serialization))]
    Serialization(String),

    /// Feature not supported on this platform.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(
        code(stow::unsupported),
        help("Mount namespaces need Linux; use the simulated backend elsewhere")
    )]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(stow::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(stow::internal), help("This is a bug, please report it"))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl StowError {
    /// Build a [`StowError::MountSyscall`], mapping `EBUSY` to [`StowError::MountBusy`].
    pub fn syscall(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        let path = path.into();
        if source.raw_os_error() == Some(EBUSY) {
            return Self::MountBusy { path };
        }
        Self::MountSyscall {
            operation,
            path,
            source,
        }
    }

    /// Shorthand for [`StowError::BackendConfig`].
    pub fn backend(backend: impl ToString, message: impl Into<String>) -> Self {
        Self::BackendConfig {
            backend: backend.to_string(),
            message: message.into(),
        }
    }

    /// True for errors raised while the mount tree was being changed.
    #[must_use]
    pub const fn is_mount_failure(&self) -> bool {
        matches!(self, Self::MountBusy { .. } | Self::MountSyscall { .. })
    }
}

/// `EBUSY` on every Linux architecture.
const EBUSY: i32 = 16;

impl From<serde_json::Error> for StowError {
    fn from(err: serde_json::Error) -> Self {
        StowError::Serialization(err.to_string())
    }
}
