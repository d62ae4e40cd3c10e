//! Storage volumes.
//!
//! A volume is a host mount with a backend-specific source that is published
//! as the root of its own peer group.

pub mod manager;
pub mod overlay;

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stow_common::{ContainerId, StowError, StowResult, VolumeId};

pub use manager::VolumeManager;
pub use overlay::OverlayLayout;

/// How a volume's content is materialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeBackend {
    /// A private directory bound onto the mount point.
    #[default]
    Plain,
    /// An overlay filesystem over read-only layers.
    Overlay,
    /// `storage` bound shallow.
    Bind,
    /// `storage` bound with its sub-mounts.
    Rbind,
}

impl VolumeBackend {
    /// Backend name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Overlay => "overlay",
            Self::Bind => "bind",
            Self::Rbind => "rbind",
        }
    }
}

impl fmt::Display for VolumeBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VolumeBackend {
    type Err = StowError;

    fn from_str(s: &str) -> StowResult<Self> {
        match s {
            "plain" => Ok(Self::Plain),
            "overlay" => Ok(Self::Overlay),
            "bind" => Ok(Self::Bind),
            "rbind" => Ok(Self::Rbind),
            other => Err(StowError::backend(other, "unknown backend")),
        }
    }
}

/// A volume creation request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeSpec {
    /// Backend.
    pub backend: VolumeBackend,
    /// Source directory (bind/rbind), upper directory (overlay) or data directory (plain).
    pub storage: Option<PathBuf>,
    /// Overlay layers, lowest first.
    pub layers: Vec<PathBuf>,
    /// Mount point; defaults to a directory under the volume's own data.
    pub path: Option<PathBuf>,
    /// Containers owning the volume.
    pub owners: BTreeSet<ContainerId>,
    /// Mount read-only.
    pub read_only: bool,
    /// Container the request was issued from; `path` is resolved in its root.
    pub origin: Option<ContainerId>,
}

impl VolumeSpec {
    /// A request for `backend` with everything else defaulted.
    #[must_use]
    pub fn new(backend: VolumeBackend) -> Self {
        Self {
            backend,
            ..Self::default()
        }
    }

    /// Set the mount point.
    #[must_use]
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set the storage directory.
    #[must_use]
    pub fn storage(mut self, storage: impl Into<PathBuf>) -> Self {
        self.storage = Some(storage.into());
        self
    }

    /// Append an overlay layer above the existing ones.
    #[must_use]
    pub fn layer(mut self, layer: impl Into<PathBuf>) -> Self {
        self.layers.push(layer.into());
        self
    }

    /// Request a read-only mount.
    #[must_use]
    pub const fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Add an owner.
    #[must_use]
    pub fn owner(mut self, owner: ContainerId) -> Self {
        self.owners.insert(owner);
        self
    }

    /// Record the container the request came from.
    #[must_use]
    pub fn origin(mut self, origin: ContainerId) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Check the backend, storage and layer combination.
    ///
    /// Runs before any mount call.
    pub fn validate(&self) -> StowResult<()> {
        let backend = self.backend;
        let fail = |message: String| Err(StowError::backend(backend, message));

        match backend {
            VolumeBackend::Bind | VolumeBackend::Rbind => {
                if self.storage.is_none() {
                    return fail("storage is required".to_string());
                }
                if !self.layers.is_empty() {
                    return fail("layers are only valid for overlay".to_string());
                }
            }
            VolumeBackend::Overlay => {
                if self.layers.is_empty() {
                    return fail("at least one layer is required".to_string());
                }
                if let Some(missing) = self.layers.iter().find(|l| !l.is_dir()) {
                    return fail(format!("layer {} is not a directory", missing.display()));
                }
            }
            VolumeBackend::Plain => {
                if !self.layers.is_empty() {
                    return fail("layers are only valid for overlay".to_string());
                }
            }
        }

        if let Some(storage) = &self.storage {
            if !storage.is_absolute() {
                return fail(format!("storage {} is not absolute", storage.display()));
            }
            if !storage.exists() {
                return fail(format!("storage {} does not exist", storage.display()));
            }
        }
        Ok(())
    }
}

/// A created volume, persisted as `volume.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Volume id.
    pub id: VolumeId,
    /// Backend.
    pub backend: VolumeBackend,
    /// Host mount point.
    pub path: PathBuf,
    /// Storage directory, when one was given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<PathBuf>,
    /// Overlay layers, lowest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<PathBuf>,
    /// Mounted read-only.
    pub read_only: bool,
    /// Containers owning the volume.
    #[serde(default)]
    pub owners: BTreeSet<ContainerId>,
    /// Container the volume was created from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<ContainerId>,
    /// Creation time.
    pub created: DateTime<Utc>,
}

impl Volume {
    /// True when `path` is this volume's mount point or below it.
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn bind_backends_need_storage() {
        for backend in [VolumeBackend::Bind, VolumeBackend::Rbind] {
            let err = VolumeSpec::new(backend).validate().unwrap_err();
            assert!(matches!(err, StowError::BackendConfig { .. }));
        }
    }

    #[test]
    fn overlay_needs_existing_layers() {
        let err = VolumeSpec::new(VolumeBackend::Overlay).validate().unwrap_err();
        assert!(err.to_string().contains("at least one layer"));

        let dir = tempdir().unwrap();
        let spec = VolumeSpec::new(VolumeBackend::Overlay).layer(dir.path().join("missing"));
        assert!(spec.validate().is_err());

        let spec = VolumeSpec::new(VolumeBackend::Overlay).layer(dir.path());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn layers_only_for_overlay() {
        let dir = tempdir().unwrap();
        let spec = VolumeSpec::new(VolumeBackend::Plain).layer(dir.path());
        assert!(spec.validate().is_err());
        let spec = VolumeSpec::new(VolumeBackend::Bind)
            .storage(dir.path())
            .layer(dir.path());
        assert!(spec.validate().is_err());
    }

    #[test]
    fn storage_must_exist() {
        let spec = VolumeSpec::new(VolumeBackend::Bind).storage("/nonexistent/stow/storage");
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn backend_names() {
        for backend in [
            VolumeBackend::Plain,
            VolumeBackend::Overlay,
            VolumeBackend::Bind,
            VolumeBackend::Rbind,
        ] {
            assert_eq!(backend.as_str().parse::<VolumeBackend>().unwrap(), backend);
        }
        assert!("zfs".parse::<VolumeBackend>().is_err());
    }
}
