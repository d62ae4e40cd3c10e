//! Volume creation, lookup and destruction.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use stow_common::{ContainerId, StowError, StowPaths, StowResult, VolumeId};

use super::{OverlayLayout, Volume, VolumeBackend, VolumeSpec};
use crate::bind::BindResolver;
use crate::mount::{MountFlags, Mounter, Scope, unmount_with_retry};
use crate::propagation::{ReadOnly, discard_staged, publish};

/// Creates and destroys volumes and keeps their metadata on disk.
#[derive(Debug)]
pub struct VolumeManager {
    mounter: Arc<dyn Mounter>,
    paths: StowPaths,
    resolver: BindResolver,
    volumes: RwLock<HashMap<VolumeId, Arc<Mutex<Volume>>>>,
    /// Serializes the path-conflict check with the mount that follows it.
    creation: Mutex<()>,
}

impl VolumeManager {
    /// Create a manager with no volumes loaded.
    pub fn new(mounter: Arc<dyn Mounter>, paths: StowPaths, resolver: BindResolver) -> Self {
        Self {
            mounter,
            paths,
            resolver,
            volumes: RwLock::new(HashMap::new()),
            creation: Mutex::new(()),
        }
    }

    /// Load every `volume.json` under the volumes directory.
    pub fn load(&self) -> StowResult<usize> {
        let dir = self.paths.volumes();
        if !dir.exists() {
            return Ok(0);
        }

        let mut volumes = self.volumes.write();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let metadata_path = entry.path().join("volume.json");
            if !metadata_path.exists() {
                continue;
            }

            let content = fs::read_to_string(&metadata_path)?;
            let volume: Volume = serde_json::from_str(&content)?;
            volumes.insert(volume.id.clone(), Arc::new(Mutex::new(volume)));
        }

        tracing::debug!(count = volumes.len(), "Loaded existing volumes");
        Ok(volumes.len())
    }

    /// Create a volume. `root` is the effective root of the requesting
    /// container; a requested path is resolved inside it.
    pub fn create(&self, spec: VolumeSpec, root: Option<&Path>) -> StowResult<Volume> {
        spec.validate()?;

        let id = VolumeId::generate();
        let _creation = self.creation.lock();

        let path = self.mount_point(&id, &spec, root)?;
        let host = self.mounter.snapshot(&Scope::Host)?;
        if host.contains(&path) {
            return Err(StowError::PathConflict { path });
        }

        let volume_dir = self.paths.volume(id.as_str());
        let made_path = !path.exists();
        fs::create_dir_all(&volume_dir)?;
        fs::create_dir_all(&path)?;

        if let Err(err) = self.mount(&id, &spec, &path) {
            self.abandon(&id, &path, made_path, false);
            return Err(err);
        }

        let volume = Volume {
            id: id.clone(),
            backend: spec.backend,
            path,
            storage: spec.storage,
            layers: spec.layers,
            read_only: spec.read_only,
            owners: spec.owners,
            origin: spec.origin,
            created: chrono::Utc::now(),
        };
        if let Err(err) = self.save(&volume) {
            self.abandon(&id, &volume.path, made_path, true);
            return Err(err);
        }

        self.volumes
            .write()
            .insert(id.clone(), Arc::new(Mutex::new(volume.clone())));

        tracing::info!(
            volume = %id,
            backend = %volume.backend,
            path = %volume.path.display(),
            read_only = volume.read_only,
            "Volume created"
        );
        Ok(volume)
    }

    /// Undo a half-finished create: the mount, the volume directory and a
    /// mount point directory the create made.
    fn abandon(&self, id: &VolumeId, path: &Path, made_path: bool, mounted: bool) {
        if mounted {
            if let Err(e) = unmount_with_retry(self.mounter.as_ref(), &Scope::Host, path) {
                tracing::warn!(volume = %id, path = %path.display(), error = %e, "Failed to unmount abandoned volume");
            }
        }
        if let Err(e) = fs::remove_dir_all(self.paths.volume(id.as_str())) {
            tracing::warn!(volume = %id, error = %e, "Failed to remove volume directory");
        }
        if made_path && path.exists() {
            if let Err(e) = fs::remove_dir(path) {
                tracing::warn!(volume = %id, path = %path.display(), error = %e, "Failed to remove mount point");
            }
        }
    }

    fn mount_point(
        &self,
        id: &VolumeId,
        spec: &VolumeSpec,
        root: Option<&Path>,
    ) -> StowResult<PathBuf> {
        match (&spec.path, root) {
            (None, _) => Ok(self.paths.volume_mount(id.as_str())),
            (Some(path), Some(root)) => self.resolver.resolve(root, path),
            (Some(path), None) if path.is_absolute() => self.resolver.resolve(Path::new("/"), path),
            (Some(path), None) => Err(StowError::Config {
                message: format!("volume path {} must be absolute", path.display()),
            }),
        }
    }

    /// Materialize at a private staging point, configure, then move into place.
    fn mount(&self, id: &VolumeId, spec: &VolumeSpec, path: &Path) -> StowResult<()> {
        let mounter = self.mounter.as_ref();
        let host = Scope::Host;
        let slot = self.paths.staging_slot(id.as_str());
        fs::create_dir_all(&slot)?;

        match spec.backend {
            VolumeBackend::Plain => {
                let storage = match &spec.storage {
                    Some(storage) => storage.clone(),
                    None => {
                        let storage = self.paths.volume_storage(id.as_str());
                        fs::create_dir_all(&storage)?;
                        storage
                    }
                };
                mounter.bind(&host, &storage, &slot, false)?;
            }
            VolumeBackend::Bind | VolumeBackend::Rbind => {
                let storage = spec
                    .storage
                    .as_deref()
                    .ok_or_else(|| StowError::backend(spec.backend, "storage is required"))?;
                let recursive = spec.backend == VolumeBackend::Rbind;
                mounter.bind(&host, storage, &slot, recursive)?;
            }
            VolumeBackend::Overlay => {
                let layout = OverlayLayout::new(
                    &spec.layers,
                    spec.storage.as_deref(),
                    self.paths.volume_overlay(id.as_str()),
                );
                layout.create_dirs()?;
                mounter.mount_fs(&host, &layout.filesystem(), &slot, MountFlags::rw())?;
            }
        }

        let flags = MountFlags::volume(spec.read_only);
        let published = publish(mounter, &host, &slot, path, flags, ReadOnly::AsRequested);
        if published.is_err() {
            discard_staged(mounter, &host, &slot);
        }
        if let Err(e) = fs::remove_dir(&slot) {
            tracing::warn!(volume = %id, slot = %slot.display(), error = %e, "Failed to remove staging slot");
        }
        published
    }

    /// Unmount a volume and remove its data directory and metadata.
    ///
    /// Links must already be gone. A busy mount is retried once with a lazy detach.
    pub fn destroy(&self, id: &VolumeId) -> StowResult<Volume> {
        let handle = self.retire(id)?;
        self.destroy_retired(&handle).inspect_err(|_| self.restore(handle.clone()))
    }

    /// Take a volume out of the registry so no new user can find it, then
    /// wait for users holding its lock to finish.
    pub fn retire(&self, id: &VolumeId) -> StowResult<Arc<Mutex<Volume>>> {
        let handle = self
            .volumes
            .write()
            .remove(id)
            .ok_or_else(|| StowError::VolumeNotFound { id: id.to_string() })?;
        drop(handle.lock());
        tracing::debug!(volume = %id, "Volume retired");
        Ok(handle)
    }

    /// Put a retired volume back.
    pub fn restore(&self, handle: Arc<Mutex<Volume>>) {
        let id = handle.lock().id.clone();
        tracing::debug!(volume = %id, "Volume restored");
        self.volumes.write().insert(id, handle);
    }

    /// Unmount and remove a volume taken out by [`retire`](Self::retire).
    pub fn destroy_retired(&self, handle: &Arc<Mutex<Volume>>) -> StowResult<Volume> {
        let nested: Vec<PathBuf> = self.list().into_iter().map(|v| v.path).collect();

        let volume = handle.lock();
        let id = volume.id.clone();
        let host = Scope::Host;

        if volume.backend == VolumeBackend::Rbind {
            // Sub-mounts brought along by the rbind go first, deepest first.
            let table = self.mounter.snapshot(&host)?;
            let children: Vec<PathBuf> = table
                .under(&volume.path)
                .filter(|e| e.path != volume.path)
                .filter(|e| {
                    !nested
                        .iter()
                        .any(|n| n.starts_with(&volume.path) && e.path.starts_with(n))
                })
                .map(|e| e.path.clone())
                .collect();
            for child in children.iter().rev() {
                unmount_with_retry(self.mounter.as_ref(), &host, child)?;
            }
        }
        unmount_with_retry(self.mounter.as_ref(), &host, &volume.path)?;

        let volume_dir = self.paths.volume(id.as_str());
        if volume_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&volume_dir) {
                tracing::warn!(volume = %id, error = %e, "Failed to remove volume directory");
            }
        }

        let destroyed = volume.clone();
        drop(volume);

        tracing::info!(volume = %id, path = %destroyed.path.display(), "Volume destroyed");
        Ok(destroyed)
    }

    /// The lock guarding one volume.
    pub fn handle(&self, id: &VolumeId) -> StowResult<Arc<Mutex<Volume>>> {
        self.volumes
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StowError::VolumeNotFound { id: id.to_string() })
    }

    /// Run `f` on a live volume while holding its lock. A volume retired
    /// while waiting for the lock is not found.
    pub fn with_volume<T>(
        &self,
        id: &VolumeId,
        f: impl FnOnce(&Volume) -> StowResult<T>,
    ) -> StowResult<T> {
        let handle = self.handle(id)?;
        let volume = handle.lock();
        let live = self
            .volumes
            .read()
            .get(id)
            .is_some_and(|h| Arc::ptr_eq(h, &handle));
        if !live {
            return Err(StowError::VolumeNotFound { id: id.to_string() });
        }
        f(&volume)
    }

    /// A copy of one volume.
    pub fn get(&self, id: &VolumeId) -> StowResult<Volume> {
        Ok(self.handle(id)?.lock().clone())
    }

    /// All volumes, ordered by mount point.
    #[must_use]
    pub fn list(&self) -> Vec<Volume> {
        let handles: Vec<_> = self.volumes.read().values().cloned().collect();
        let mut volumes: Vec<Volume> = handles.iter().map(|h| h.lock().clone()).collect();
        volumes.sort_by(|a, b| a.path.cmp(&b.path));
        volumes
    }

    /// The volume mounted exactly at `path`.
    #[must_use]
    pub fn find_by_path(&self, path: &Path) -> Option<Volume> {
        self.list().into_iter().find(|v| v.path == path)
    }

    /// Add `owner` to a volume's owners.
    pub fn add_owner(&self, id: &VolumeId, owner: &ContainerId) -> StowResult<()> {
        let handle = self.handle(id)?;
        let mut volume = handle.lock();
        if volume.owners.insert(owner.clone()) {
            self.save(&volume)?;
        }
        Ok(())
    }

    /// Remove `owner`; returns true when the volume is left without owners.
    pub fn remove_owner(&self, id: &VolumeId, owner: &ContainerId) -> StowResult<bool> {
        let handle = self.handle(id)?;
        let mut volume = handle.lock();
        if volume.owners.remove(owner) {
            self.save(&volume)?;
        }
        Ok(volume.owners.is_empty())
    }

    fn save(&self, volume: &Volume) -> StowResult<()> {
        let path = self.paths.volume_metadata(volume.id.as_str());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(volume)?;
        fs::write(&path, json)?;

        tracing::debug!(volume = %volume.id, path = %path.display(), "Saved volume metadata");
        Ok(())
    }
}
