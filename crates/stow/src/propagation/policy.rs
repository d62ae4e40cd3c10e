//! Publishing volume mounts and attaching appearances of them.
//!
//! A volume's mount point is the root of its own peer group. Everything else
//! that shows the volume (bind specs, link materializations, bind volumes)
//! receives from that group and is re-shared so mounts below it keep flowing
//! into nested namespaces.

use std::path::Path;

use stow_common::StowResult;

use crate::mount::{MountFlags, Mounter, Propagation, Scope, UnmountFlags};

/// How a remount treats mounts that are already read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOnly {
    /// Apply the requested flags as given.
    AsRequested,
    /// Never turn a read-only mount writable.
    Keep,
}

/// Remount the mount at `path` (and every mount below it when `recursive`).
pub fn apply_flags(
    mounter: &dyn Mounter,
    scope: &Scope,
    path: &Path,
    flags: MountFlags,
    recursive: bool,
    read_only: ReadOnly,
) -> StowResult<()> {
    let table = mounter.snapshot(scope)?;
    let entries: Vec<_> = if recursive {
        table.under(path).collect()
    } else {
        table.get(path).into_iter().collect()
    };

    for entry in entries {
        let mut effective = flags;
        if read_only == ReadOnly::Keep && entry.is_read_only() {
            effective.readonly = true;
        }
        mounter.remount(scope, &entry.path, effective)?;
    }
    Ok(())
}

/// Finish a tree prepared at a private staging point and move it onto `target`.
///
/// The staged tree is remounted with `flags`, made slave (keeping whatever it
/// receives from) and then shared with fresh peer groups. Moving it under a
/// shared parent afterwards propagates the finished mounts.
pub fn publish(
    mounter: &dyn Mounter,
    scope: &Scope,
    staged: &Path,
    target: &Path,
    flags: MountFlags,
    read_only: ReadOnly,
) -> StowResult<()> {
    apply_flags(mounter, scope, staged, flags, true, read_only)?;
    mounter.set_propagation(scope, staged, Propagation::Slave, true)?;
    mounter.set_propagation(scope, staged, Propagation::Shared, true)?;
    mounter.move_mount(scope, staged, target)
}

/// Bind `source` at the staging point `slot`, then publish it at `target`.
/// A failure leaves nothing mounted at `slot`.
#[allow(clippy::too_many_arguments)]
pub fn publish_bind(
    mounter: &dyn Mounter,
    scope: &Scope,
    source: &Path,
    slot: &Path,
    target: &Path,
    flags: MountFlags,
    recursive: bool,
    read_only: ReadOnly,
) -> StowResult<()> {
    mounter.bind(scope, source, slot, recursive)?;
    if let Err(err) = publish(mounter, scope, slot, target, flags, read_only) {
        discard_staged(mounter, scope, slot);
        return Err(err);
    }
    Ok(())
}

/// Bind `source` at `target` in place and make the copy a re-shared slave.
pub fn attach_appearance(
    mounter: &dyn Mounter,
    scope: &Scope,
    source: &Path,
    target: &Path,
    flags: MountFlags,
    recursive: bool,
) -> StowResult<()> {
    mounter.bind(scope, source, target, recursive)?;
    let configured = apply_flags(mounter, scope, target, flags, recursive, ReadOnly::Keep)
        .and_then(|()| mounter.set_propagation(scope, target, Propagation::Slave, recursive))
        .and_then(|()| mounter.set_propagation(scope, target, Propagation::Shared, recursive));
    if let Err(err) = configured {
        discard_staged(mounter, scope, target);
        return Err(err);
    }
    Ok(())
}

/// Lazily detach whatever is left at a staging point.
pub fn discard_staged(mounter: &dyn Mounter, scope: &Scope, slot: &Path) {
    if let Err(e) = mounter.unmount(scope, slot, UnmountFlags::detach()) {
        tracing::warn!(%scope, slot = %slot.display(), error = %e, "Failed to clean up staged mount");
    }
}
