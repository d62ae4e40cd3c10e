//! Per-mount flags.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Per-mount flags applied by a bind remount or a filesystem mount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountFlags {
    /// Read-only mount.
    pub readonly: bool,
    /// No suid.
    pub nosuid: bool,
    /// No dev.
    pub nodev: bool,
    /// No exec.
    pub noexec: bool,
}

impl MountFlags {
    /// Read-write, nothing stripped.
    #[must_use]
    pub const fn rw() -> Self {
        Self {
            readonly: false,
            nosuid: false,
            nodev: false,
            noexec: false,
        }
    }

    /// Base policy of every volume mount point: `nodev,nosuid`, plus `ro` on request.
    #[must_use]
    pub const fn volume(readonly: bool) -> Self {
        Self {
            readonly,
            nosuid: true,
            nodev: true,
            noexec: false,
        }
    }

    /// Options for kernel pseudo filesystems (`/proc`, `/sys`).
    #[must_use]
    pub const fn pseudo(readonly: bool) -> Self {
        Self {
            readonly,
            nosuid: true,
            nodev: true,
            noexec: true,
        }
    }

    /// Return a copy with `readonly` set.
    #[must_use]
    pub const fn read_only(mut self) -> Self {
        self.readonly = true;
        self
    }

    /// Option strings as they appear in mountinfo (`rw`/`ro`, `nosuid`, ...).
    #[must_use]
    pub fn options(&self) -> BTreeSet<String> {
        let mut set = BTreeSet::new();
        set.insert(if self.readonly { "ro" } else { "rw" }.to_string());
        if self.nosuid {
            set.insert("nosuid".to_string());
        }
        if self.nodev {
            set.insert("nodev".to_string());
        }
        if self.noexec {
            set.insert("noexec".to_string());
        }
        set
    }

    /// Parse the per-mount option column of mountinfo.
    #[must_use]
    pub fn from_options<'a>(options: impl IntoIterator<Item = &'a str>) -> Self {
        let mut flags = Self::rw();
        for option in options {
            match option {
                "ro" => flags.readonly = true,
                "nosuid" => flags.nosuid = true,
                "nodev" => flags.nodev = true,
                "noexec" => flags.noexec = true,
                _ => {}
            }
        }
        flags
    }

    /// `MS_*` bits for mount(2).
    #[cfg(target_os = "linux")]
    #[must_use]
    pub fn ms_bits(&self) -> libc::c_ulong {
        let mut bits = 0;
        if self.readonly {
            bits |= libc::MS_RDONLY;
        }
        if self.nosuid {
            bits |= libc::MS_NOSUID;
        }
        if self.nodev {
            bits |= libc::MS_NODEV;
        }
        if self.noexec {
            bits |= libc::MS_NOEXEC;
        }
        bits
    }
}
