//! Standard filesystem paths for stow.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for stow data.
pub static STOW_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("STOW_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/stow"))
});

/// Default runtime directory for stow.
pub static STOW_RUNTIME_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("STOW_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run/stow"))
});

/// Standard paths used by the volume subsystem.
#[derive(Debug, Clone)]
pub struct StowPaths {
    /// Root data directory (default: /var/lib/stow).
    pub root: PathBuf,
    /// Runtime directory (default: /run/stow).
    pub runtime: PathBuf,
}

impl StowPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let runtime = root.join("run");
        Self { root, runtime }
    }

    /// Directory for volume data.
    #[must_use]
    pub fn volumes(&self) -> PathBuf {
        self.root.join("volumes")
    }

    /// Directory for a specific volume.
    #[must_use]
    pub fn volume(&self, id: &str) -> PathBuf {
        self.volumes().join(id)
    }

    /// Internal storage of a plain volume.
    #[must_use]
    pub fn volume_storage(&self, id: &str) -> PathBuf {
        self.volume(id).join("storage")
    }

    /// Default mount point of a volume created without a path.
    #[must_use]
    pub fn volume_mount(&self, id: &str) -> PathBuf {
        self.volume(id).join("volume")
    }

    /// Overlay upper and work directories.
    #[must_use]
    pub fn volume_overlay(&self, id: &str) -> (PathBuf, PathBuf) {
        let dir = self.volume(id);
        (dir.join("upper"), dir.join("work"))
    }

    /// Volume metadata file.
    #[must_use]
    pub fn volume_metadata(&self, id: &str) -> PathBuf {
        self.volume(id).join("volume.json")
    }

    /// Directory for container records.
    #[must_use]
    pub fn containers(&self) -> PathBuf {
        self.root.join("containers")
    }

    /// Directory for a specific container.
    #[must_use]
    pub fn container(&self, id: &str) -> PathBuf {
        self.containers().join(id)
    }

    /// Persisted volume links of a container.
    #[must_use]
    pub fn container_links(&self, id: &str) -> PathBuf {
        self.container(id).join("links.json")
    }

    /// Private directory where mounts are configured before being moved into place.
    #[must_use]
    pub fn staging(&self) -> PathBuf {
        self.runtime.join("staging")
    }

    /// Staging point for one volume or link.
    #[must_use]
    pub fn staging_slot(&self, name: &str) -> PathBuf {
        self.staging().join(name)
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(&self.runtime)?;
        std::fs::create_dir_all(self.volumes())?;
        std::fs::create_dir_all(self.containers())?;
        std::fs::create_dir_all(self.staging())?;
        Ok(())
    }
}

impl Default for StowPaths {
    fn default() -> Self {
        Self {
            root: STOW_ROOT.clone(),
            runtime: STOW_RUNTIME_DIR.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_root() {
        let paths = StowPaths::with_root("/tmp/stow-test");
        assert_eq!(paths.volumes(), PathBuf::from("/tmp/stow-test/volumes"));
        assert_eq!(paths.runtime, PathBuf::from("/tmp/stow-test/run"));
        assert_eq!(
            paths.staging_slot("abc"),
            PathBuf::from("/tmp/stow-test/run/staging/abc")
        );
    }

    #[test]
    fn volume_layout() {
        let paths = StowPaths::with_root("/srv/stow");
        assert_eq!(
            paths.volume_mount("0123456789ab"),
            PathBuf::from("/srv/stow/volumes/0123456789ab/volume")
        );
        assert_eq!(
            paths.volume_storage("0123456789ab"),
            PathBuf::from("/srv/stow/volumes/0123456789ab/storage")
        );
        let (upper, work) = paths.volume_overlay("0123456789ab");
        assert!(upper.ends_with("upper"));
        assert!(work.ends_with("work"));
    }

    #[test]
    fn create_dirs_under_tempdir() {
        let temp = tempfile::tempdir().unwrap();
        let paths = StowPaths::with_root(temp.path());
        paths.create_dirs().unwrap();
        assert!(paths.staging().is_dir());
        assert!(paths.containers().is_dir());
    }
}
