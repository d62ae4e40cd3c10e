#![allow(unsafe_code)]
//! Threads that own container mount namespaces.
//!
//! A mount namespace lives as long as something references it. Each container
//! namespace is held by one dedicated thread that has unshared both its mount
//! namespace and its filesystem context (root and cwd), so it can pivot into
//! the container root without affecting the rest of the process. Mount calls
//! for the namespace are shipped to that thread as jobs.

use std::ffi::CString;
use std::path::Path;
use std::thread::JoinHandle;

use crossbeam_channel::{Sender, bounded, unbounded};
use stow_common::{StowError, StowResult};

use super::kernel::sys_mount;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A thread parked inside a private mount namespace.
#[derive(Debug)]
pub(crate) struct NamespaceWorker {
    name: String,
    sender: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl NamespaceWorker {
    /// Start the thread and wait until its namespace is set up.
    pub(crate) fn spawn(name: &str) -> StowResult<Self> {
        let (sender, receiver) = unbounded::<Job>();
        let (ready_tx, ready_rx) = bounded::<StowResult<()>>(1);

        let handle = std::thread::Builder::new()
            .name(format!("stow-ns-{name}"))
            .spawn(move || {
                let entered = enter_private_namespace();
                let failed = entered.is_err();
                let _ = ready_tx.send(entered);
                if failed {
                    return;
                }
                for job in receiver {
                    job();
                }
            })?;

        ready_rx.recv().map_err(|_| StowError::Internal {
            message: format!("namespace worker {name} exited during setup"),
        })??;

        tracing::debug!(name, "Namespace worker started");

        Ok(Self {
            name: name.to_string(),
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    /// Run `job` on the worker thread and wait for its result.
    pub(crate) fn run<T, F>(&self, job: F) -> StowResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> StowResult<T> + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let sender = self.sender.as_ref().ok_or_else(|| self.gone())?;
        sender
            .send(Box::new(move || {
                let _ = tx.send(job());
            }))
            .map_err(|_| self.gone())?;
        rx.recv().map_err(|_| self.gone())?
    }

    fn gone(&self) -> StowError {
        StowError::Internal {
            message: format!("namespace worker {} is gone", self.name),
        }
    }
}

impl Drop for NamespaceWorker {
    fn drop(&mut self) {
        // Closing the channel ends the job loop; the namespace dies with the thread.
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        tracing::debug!(name = %self.name, "Namespace worker stopped");
    }
}

fn enter_private_namespace() -> StowResult<()> {
    use rustix::thread::{UnshareFlags, unshare_unsafe};

    // Safety: this thread is dedicated to the namespace; after unsharing FS it
    // no longer shares root or cwd with the rest of the process.
    unsafe {
        unshare_unsafe(UnshareFlags::NEWNS | UnshareFlags::FS)
            .map_err(|e| StowError::syscall("unshare", "/", e.into()))?;
    }

    sys_mount(None, Path::new("/"), None, libc::MS_REC | libc::MS_SLAVE, None)
        .map_err(|e| StowError::syscall("make-rslave", "/", e))
}

/// pivot_root into `new_root` from the worker thread, dropping the old root.
pub(crate) fn pivot_into(new_root: &Path) -> StowResult<()> {
    use rustix::mount::{UnmountFlags, unmount};
    use rustix::process::chdir;

    tracing::debug!(new_root = %new_root.display(), "Executing pivot_root");

    chdir(new_root).map_err(|e| StowError::syscall("chdir", new_root, e.into()))?;

    let dot = CString::new(".").map_err(|e| StowError::Internal {
        message: format!("Invalid path: {e}"),
    })?;
    // Stack the old root on top of the new one, then detach it.
    let ret = unsafe { libc::syscall(libc::SYS_pivot_root, dot.as_ptr(), dot.as_ptr()) };
    if ret != 0 {
        return Err(StowError::syscall(
            "pivot_root",
            new_root,
            std::io::Error::last_os_error(),
        ));
    }

    unmount(".", UnmountFlags::DETACH)
        .map_err(|e| StowError::syscall("umount old root", new_root, e.into()))?;
    chdir("/").map_err(|e| StowError::syscall("chdir", "/", e.into()))?;

    tracing::debug!("pivot_root successful");
    Ok(())
}
