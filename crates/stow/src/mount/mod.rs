//! Mount operations.
//!
//! Every mount side effect goes through a [`Mounter`]. Paths passed to a
//! mounter are interpreted in the coordinates of the given [`Scope`]: host
//! paths for [`Scope::Host`], and for a container the namespace's current
//! root (host paths until [`Mounter::pivot_root`], container paths after).

mod flags;
#[cfg(target_os = "linux")]
mod kernel;
mod table;
#[cfg(target_os = "linux")]
mod worker;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use stow_common::{ContainerId, StowError, StowResult};

pub use flags::MountFlags;
#[cfg(target_os = "linux")]
pub use kernel::KernelMounter;
pub use table::{MountEntry, MountTable, PeerGroupId};

/// Which mount namespace an operation or snapshot refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// The host namespace.
    Host,
    /// A container's private namespace.
    Container(ContainerId),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Container(id) => write!(f, "container {id}"),
        }
    }
}

/// Propagation type change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// Join or create a peer group.
    Shared,
    /// Receive from the current peer group without sending back.
    Slave,
    /// No propagation at all.
    Private,
}

/// Unmount flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnmountFlags {
    /// Force unmount.
    pub force: bool,
    /// Lazy unmount (detach the whole subtree).
    pub detach: bool,
}

impl UnmountFlags {
    /// Lazy detach.
    #[must_use]
    pub const fn detach() -> Self {
        Self {
            force: false,
            detach: true,
        }
    }
}

/// A filesystem instance to mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filesystem {
    /// Filesystem type.
    pub fstype: String,
    /// Mount source.
    pub source: String,
    /// Filesystem-specific options.
    pub data: Option<String>,
}

impl Filesystem {
    /// A filesystem whose source is its own type name.
    #[must_use]
    pub fn new(fstype: &str, data: Option<&str>) -> Self {
        Self {
            fstype: fstype.to_string(),
            source: fstype.to_string(),
            data: data.map(str::to_string),
        }
    }

    /// tmpfs with the given options.
    #[must_use]
    pub fn tmpfs(data: &str) -> Self {
        Self::new("tmpfs", Some(data))
    }
}

/// The mount tree interface used by the volume and namespace code.
pub trait Mounter: Send + Sync + fmt::Debug {
    /// Mount a new filesystem instance at `target`.
    fn mount_fs(
        &self,
        scope: &Scope,
        fs: &Filesystem,
        target: &Path,
        flags: MountFlags,
    ) -> StowResult<()>;

    /// Bind `source` onto `target`, with its sub-mounts when `recursive`.
    fn bind(&self, scope: &Scope, source: &Path, target: &Path, recursive: bool)
    -> StowResult<()>;

    /// Replace the per-mount flags of the topmost mount at `target`.
    fn remount(&self, scope: &Scope, target: &Path, flags: MountFlags) -> StowResult<()>;

    /// Change propagation of the mount at `target` (and below when `recursive`).
    fn set_propagation(
        &self,
        scope: &Scope,
        target: &Path,
        propagation: Propagation,
        recursive: bool,
    ) -> StowResult<()>;

    /// Move the mount tree at `source` to `target`.
    fn move_mount(&self, scope: &Scope, source: &Path, target: &Path) -> StowResult<()>;

    /// Unmount the topmost mount at `target`.
    fn unmount(&self, scope: &Scope, target: &Path, flags: UnmountFlags) -> StowResult<()>;

    /// Create a private namespace for `id`: a copy of the host tree, recursively slave.
    fn create_namespace(&self, id: &ContainerId) -> StowResult<()>;

    /// Make `new_root` the root of the namespace and drop everything outside it.
    fn pivot_root(&self, id: &ContainerId, new_root: &Path) -> StowResult<()>;

    /// Release the namespace and every mount in it.
    fn destroy_namespace(&self, id: &ContainerId) -> StowResult<()>;

    /// Snapshot the mount table of a scope.
    fn snapshot(&self, scope: &Scope) -> StowResult<MountTable>;

    /// Populate a freshly mounted `/dev` with the standard device nodes.
    fn populate_dev(&self, _scope: &Scope, _dev: &Path) -> StowResult<()> {
        Ok(())
    }
}

/// Unmount, retrying once with a lazy detach when the mount is busy.
pub fn unmount_with_retry(mounter: &dyn Mounter, scope: &Scope, target: &Path) -> StowResult<()> {
    match mounter.unmount(scope, target, UnmountFlags::default()) {
        Err(StowError::MountBusy { .. }) => {
            tracing::warn!(
                %scope,
                target = %target.display(),
                "Mount busy, retrying with detach"
            );
            mounter.unmount(scope, target, UnmountFlags::detach())
        }
        other => other,
    }
}
