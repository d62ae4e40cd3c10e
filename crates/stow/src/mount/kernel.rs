#![allow(unsafe_code)]
//! Mounter backed by real mount syscalls.

use std::collections::HashMap;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use stow_common::{ContainerId, StowError, StowResult};

use super::worker::{NamespaceWorker, pivot_into};
use super::{Filesystem, MountFlags, MountTable, Mounter, Propagation, Scope, UnmountFlags};

/// Standard device nodes created in a fresh `/dev`.
/// Format: (name, major, minor, mode)
const DEVICE_NODES: &[(&str, u32, u32, u32)] = &[
    ("null", 1, 3, 0o666),
    ("zero", 1, 5, 0o666),
    ("full", 1, 7, 0o666),
    ("random", 1, 8, 0o666),
    ("urandom", 1, 9, 0o666),
    ("tty", 5, 0, 0o666),
];

/// Mounts through the kernel. Host operations run on the calling thread;
/// container operations run on the namespace's worker thread.
#[derive(Debug, Default)]
pub struct KernelMounter {
    workers: RwLock<HashMap<ContainerId, Arc<NamespaceWorker>>>,
}

impl KernelMounter {
    /// Create a mounter with no container namespaces.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn worker(&self, id: &ContainerId) -> StowResult<Arc<NamespaceWorker>> {
        self.workers
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StowError::ContainerNotFound { id: id.to_string() })
    }

    fn exec<T, F>(&self, scope: &Scope, job: F) -> StowResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> StowResult<T> + Send + 'static,
    {
        match scope {
            Scope::Host => job(),
            Scope::Container(id) => self.worker(id)?.run(job),
        }
    }
}

impl Mounter for KernelMounter {
    fn mount_fs(
        &self,
        scope: &Scope,
        fs: &Filesystem,
        target: &Path,
        flags: MountFlags,
    ) -> StowResult<()> {
        tracing::debug!(
            %scope,
            fstype = %fs.fstype,
            target = %target.display(),
            ?flags,
            "Mounting filesystem"
        );
        let fs = fs.clone();
        let target = target.to_path_buf();
        self.exec(scope, move || {
            ensure_mountpoint(None, &target)?;
            sys_mount(
                Some(&fs.source),
                &target,
                Some(&fs.fstype),
                flags.ms_bits(),
                fs.data.as_deref(),
            )
            .map_err(|e| StowError::syscall("mount", &target, e))
        })
    }

    fn bind(
        &self,
        scope: &Scope,
        source: &Path,
        target: &Path,
        recursive: bool,
    ) -> StowResult<()> {
        use rustix::mount::{mount_bind, mount_bind_recursive};

        tracing::debug!(
            %scope,
            source = %source.display(),
            target = %target.display(),
            recursive,
            "Creating bind mount"
        );
        let source = source.to_path_buf();
        let target = target.to_path_buf();
        self.exec(scope, move || {
            ensure_mountpoint(Some(&source), &target)?;
            let result = if recursive {
                mount_bind_recursive(&source, &target)
            } else {
                mount_bind(&source, &target)
            };
            result.map_err(|e| StowError::syscall("bind", &target, e.into()))
        })
    }

    fn remount(&self, scope: &Scope, target: &Path, flags: MountFlags) -> StowResult<()> {
        tracing::debug!(%scope, target = %target.display(), ?flags, "Remounting");
        let target = target.to_path_buf();
        self.exec(scope, move || {
            sys_mount(
                None,
                &target,
                None,
                libc::MS_REMOUNT | libc::MS_BIND | flags.ms_bits(),
                None,
            )
            .map_err(|e| StowError::syscall("remount", &target, e))
        })
    }

    fn set_propagation(
        &self,
        scope: &Scope,
        target: &Path,
        propagation: Propagation,
        recursive: bool,
    ) -> StowResult<()> {
        tracing::debug!(
            %scope,
            target = %target.display(),
            ?propagation,
            recursive,
            "Changing propagation"
        );
        let mut bits = match propagation {
            Propagation::Shared => libc::MS_SHARED,
            Propagation::Slave => libc::MS_SLAVE,
            Propagation::Private => libc::MS_PRIVATE,
        };
        if recursive {
            bits |= libc::MS_REC;
        }
        let target = target.to_path_buf();
        self.exec(scope, move || {
            sys_mount(None, &target, None, bits, None)
                .map_err(|e| StowError::syscall("propagation", &target, e))
        })
    }

    fn move_mount(&self, scope: &Scope, source: &Path, target: &Path) -> StowResult<()> {
        tracing::debug!(
            %scope,
            source = %source.display(),
            target = %target.display(),
            "Moving mount"
        );
        let source = source.to_path_buf();
        let target = target.to_path_buf();
        self.exec(scope, move || {
            ensure_mountpoint(Some(&source), &target)?;
            rustix::mount::mount_move(&source, &target)
                .map_err(|e| StowError::syscall("move", &target, e.into()))
        })
    }

    fn unmount(&self, scope: &Scope, target: &Path, flags: UnmountFlags) -> StowResult<()> {
        use rustix::mount::{UnmountFlags as RustixUnmountFlags, unmount};

        tracing::debug!(%scope, target = %target.display(), ?flags, "Unmounting filesystem");

        let mut rflags = RustixUnmountFlags::empty();
        if flags.force {
            rflags |= RustixUnmountFlags::FORCE;
        }
        if flags.detach {
            rflags |= RustixUnmountFlags::DETACH;
        }
        let target = target.to_path_buf();
        self.exec(scope, move || {
            unmount(&target, rflags).map_err(|e| StowError::syscall("umount", &target, e.into()))
        })
    }

    fn create_namespace(&self, id: &ContainerId) -> StowResult<()> {
        let mut workers = self.workers.write();
        if workers.contains_key(id) {
            return Err(StowError::Internal {
                message: format!("namespace for {id} already exists"),
            });
        }
        let worker = NamespaceWorker::spawn(id.as_str())?;
        workers.insert(id.clone(), Arc::new(worker));
        Ok(())
    }

    fn pivot_root(&self, id: &ContainerId, new_root: &Path) -> StowResult<()> {
        let new_root = new_root.to_path_buf();
        self.worker(id)?.run(move || pivot_into(&new_root))
    }

    fn destroy_namespace(&self, id: &ContainerId) -> StowResult<()> {
        // Dropping the last handle joins the worker thread.
        let worker = self.workers.write().remove(id);
        drop(worker);
        Ok(())
    }

    fn snapshot(&self, scope: &Scope) -> StowResult<MountTable> {
        match scope {
            Scope::Host => MountTable::read_self(),
            Scope::Container(id) => self
                .worker(id)?
                .run(|| MountTable::read(Path::new("/proc/thread-self/mountinfo"))),
        }
    }

    fn populate_dev(&self, scope: &Scope, dev: &Path) -> StowResult<()> {
        let dev = dev.to_path_buf();
        self.exec(scope, move || create_device_nodes(&dev))
    }
}

/// Thin wrapper over mount(2) for calls that need explicit flag bits or data.
pub(super) fn sys_mount(
    source: Option<&str>,
    target: &Path,
    fstype: Option<&str>,
    flags: libc::c_ulong,
    data: Option<&str>,
) -> std::io::Result<()> {
    let source = source.map(CString::new).transpose()?;
    let target = CString::new(target.as_os_str().as_bytes())?;
    let fstype = fstype.map(CString::new).transpose()?;
    let data = data.map(CString::new).transpose()?;

    let ret = unsafe {
        libc::mount(
            source.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
            target.as_ptr(),
            fstype.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
            flags,
            data.as_ref()
                .map_or(std::ptr::null(), |s| s.as_ptr().cast::<libc::c_void>()),
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Make sure `target` exists with the same kind (file or directory) as `source`.
fn ensure_mountpoint(source: Option<&PathBuf>, target: &Path) -> StowResult<()> {
    if target.symlink_metadata().is_ok() {
        return Ok(());
    }
    let source_is_file = source
        .and_then(|s| std::fs::metadata(s).ok())
        .is_some_and(|m| !m.is_dir());
    if source_is_file {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::File::create(target)?;
    } else {
        std::fs::create_dir_all(target)?;
    }
    Ok(())
}

fn create_device_nodes(dev: &Path) -> StowResult<()> {
    use rustix::fs::{CWD, FileType, Mode, makedev, mknodat};

    for (name, major, minor, mode) in DEVICE_NODES {
        let path = dev.join(name);
        if path.exists() {
            continue;
        }

        tracing::debug!(device = %name, major, minor, "Creating device node");

        let dev_num = makedev(*major, *minor);
        if let Err(e) = mknodat(
            CWD,
            &path,
            FileType::CharacterDevice,
            Mode::from_raw_mode(*mode),
            dev_num,
        ) {
            // Permission denied is expected in rootless mode
            if e.kind() != std::io::ErrorKind::PermissionDenied {
                tracing::warn!(device = %name, error = %e, "Failed to create device node");
            }
        }
    }

    Ok(())
}
