//! Overlay filesystem layout for overlay volumes.

use std::path::{Path, PathBuf};

use stow_common::StowResult;

use crate::mount::Filesystem;

/// Directories making up an overlay mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayLayout {
    /// Lower directories, highest layer first as overlayfs expects.
    pub lower_dirs: Vec<PathBuf>,
    /// Upper directory (writable layer).
    pub upper_dir: PathBuf,
    /// Work directory (required by overlayfs).
    pub work_dir: PathBuf,
}

impl OverlayLayout {
    /// Layout for `layers` given lowest first.
    ///
    /// With `storage`, the upper and work directories live inside it;
    /// otherwise `default_dirs` (upper, work) are used.
    #[must_use]
    pub fn new(layers: &[PathBuf], storage: Option<&Path>, default_dirs: (PathBuf, PathBuf)) -> Self {
        let (upper_dir, work_dir) = match storage {
            Some(storage) => (storage.join("upper"), storage.join("work")),
            None => default_dirs,
        };
        Self {
            lower_dirs: layers.iter().rev().cloned().collect(),
            upper_dir,
            work_dir,
        }
    }

    /// Create the upper and work directories.
    pub fn create_dirs(&self) -> StowResult<()> {
        std::fs::create_dir_all(&self.upper_dir)?;
        std::fs::create_dir_all(&self.work_dir)?;
        Ok(())
    }

    /// Get the mount options string.
    #[must_use]
    pub fn mount_options(&self) -> String {
        let lower = self
            .lower_dirs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");

        format!(
            "lowerdir={},upperdir={},workdir={}",
            lower,
            self.upper_dir.display(),
            self.work_dir.display()
        )
    }

    /// The filesystem to mount.
    #[must_use]
    pub fn filesystem(&self) -> Filesystem {
        Filesystem::new("overlay", Some(&self.mount_options()))
    }
}
