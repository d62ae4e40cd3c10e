//! The runtime facade: volumes, containers and links behind one API.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use stow_common::{ContainerId, StowError, StowResult, VolumeId};

use super::config::RuntimeConfig;
use super::container::Container;
use super::events::{EventBus, RuntimeEvent, now};
use super::lifecycle::{ContainerStatus, LifecycleEvent};
use super::link::{LinkRegistry, LinkState, VolumeLink};
use super::state::StateManager;
use crate::bind::BindSpec;
use crate::mount::{MountTable, Mounter, Propagation, Scope};
use crate::namespace::{LinkRequest, NamespaceBuilder, NamespaceContext};
use crate::volume::{Volume, VolumeManager, VolumeSpec};

/// Volume and mount-namespace runtime.
#[derive(Debug)]
pub struct Runtime {
    config: RuntimeConfig,
    mounter: Arc<dyn Mounter>,
    volumes: VolumeManager,
    builder: NamespaceBuilder,
    links: LinkRegistry,
    containers: RwLock<HashMap<ContainerId, Arc<Mutex<Container>>>>,
    state: StateManager,
}

impl Runtime {
    /// Open the runtime with the backend named by `config`.
    pub fn new(config: RuntimeConfig) -> StowResult<Self> {
        let mounter = config.mounter()?;
        Self::with_mounter(config, mounter)
    }

    /// Open the runtime on an explicit mounter.
    ///
    /// Prepares the staging point and loads volumes, containers and links
    /// saved by earlier runs.
    pub fn with_mounter(config: RuntimeConfig, mounter: Arc<dyn Mounter>) -> StowResult<Self> {
        config.paths.create_dirs()?;
        prepare_staging(mounter.as_ref(), &config.paths.staging())?;

        let resolver = config.resolver();
        let runtime = Self {
            volumes: VolumeManager::new(mounter.clone(), config.paths.clone(), resolver),
            builder: NamespaceBuilder::new(mounter.clone(), config.paths.clone(), resolver),
            links: LinkRegistry::new(),
            containers: RwLock::new(HashMap::new()),
            state: StateManager::new(config.paths.clone()),
            mounter,
            config,
        };
        runtime.volumes.load()?;
        runtime.load_containers()?;
        Ok(runtime)
    }

    /// The configuration the runtime was opened with.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The event bus.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.config.event_bus
    }

    fn load_containers(&self) -> StowResult<()> {
        for id in self.state.list()? {
            let mut container = self.state.load(&id)?;
            let mut links = self.state.load_links(&id)?;

            if container.status() == ContainerStatus::Running {
                // The namespace died with the process that built it; host-side
                // link mounts outlive it.
                tracing::warn!(container = %id, "Recovering container left running");
                container.mark_stale();
                for link in &mut links {
                    if let Some(placement) = link.unmounted() {
                        if placement.scope == Scope::Host {
                            if let Err(e) = self.builder.unmount_link(&placement) {
                                tracing::warn!(
                                    container = %id,
                                    target = %placement.path.display(),
                                    error = %e,
                                    "Failed to unmount stale link"
                                );
                            }
                        }
                    }
                }
                if let Err(e) = self.mounter.destroy_namespace(&id) {
                    tracing::debug!(container = %id, error = %e, "No namespace to destroy");
                }
                self.state.save(&container)?;
                self.state.save_links(&id, &links)?;
            }

            self.links.restore(&id, links);
            self.containers
                .write()
                .insert(id, Arc::new(Mutex::new(container)));
        }
        tracing::debug!(count = self.containers.read().len(), "Loaded containers");
        Ok(())
    }

    fn handle(&self, id: &ContainerId) -> StowResult<Arc<Mutex<Container>>> {
        self.containers
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StowError::ContainerNotFound { id: id.to_string() })
    }

    fn persist(&self, container: &Container) -> StowResult<()> {
        self.state.save(container)?;
        self.state
            .save_links(container.id(), &self.links.for_container(container.id()))
    }

    // Volumes

    /// Create a volume. With an origin container, the path is resolved in its root.
    pub fn create_volume(&self, spec: VolumeSpec) -> StowResult<Volume> {
        let root = match &spec.origin {
            Some(origin) => self
                .handle(origin)?
                .lock()
                .root()
                .map(Path::to_path_buf),
            None => None,
        };
        let volume = self.volumes.create(spec, root.as_deref())?;
        self.events().publish(RuntimeEvent::VolumeCreated {
            id: volume.id.to_string(),
            path: volume.path.display().to_string(),
            timestamp: now(),
        });
        Ok(volume)
    }

    /// Unlink a volume everywhere, then unmount and remove it.
    ///
    /// The volume is retired first, so no link made meanwhile can reach it.
    /// On failure it is put back.
    pub fn destroy_volume(&self, id: &VolumeId) -> StowResult<Volume> {
        let retired = self.volumes.retire(id)?;
        let volume = match self.unlink_and_destroy(id, &retired) {
            Ok(volume) => volume,
            Err(e) => {
                tracing::warn!(volume = %id, error = %e, "Volume destroy failed");
                self.volumes.restore(retired);
                return Err(e);
            }
        };
        self.events().publish(RuntimeEvent::VolumeDestroyed {
            id: id.to_string(),
            timestamp: now(),
        });
        Ok(volume)
    }

    fn unlink_and_destroy(&self, id: &VolumeId, retired: &Arc<Mutex<Volume>>) -> StowResult<Volume> {
        for container in self.links.containers_of(id) {
            self.unlink(id, &container)?;
        }
        self.volumes.destroy_retired(retired)
    }

    /// All volumes, ordered by mount point.
    #[must_use]
    pub fn volumes(&self) -> Vec<Volume> {
        self.volumes.list()
    }

    /// One volume.
    pub fn volume(&self, id: &VolumeId) -> StowResult<Volume> {
        self.volumes.get(id)
    }

    /// Add an owner to a volume.
    pub fn add_owner(&self, id: &VolumeId, owner: &ContainerId) -> StowResult<()> {
        self.handle(owner)?;
        self.volumes.add_owner(id, owner)
    }

    // Links

    /// Link a volume into a container, mounting it right away when running.
    ///
    /// Holds the container lock, then the volume lock, for the whole call.
    pub fn link(
        &self,
        volume: &VolumeId,
        container: &ContainerId,
        target: impl Into<PathBuf>,
        read_only: bool,
    ) -> StowResult<VolumeLink> {
        let target = target.into();
        let handle = self.handle(container)?;
        let mut c = handle.lock();
        let link = self.volumes.with_volume(volume, |v| {
            let link = self.links.add(volume, container, target, read_only)?;
            if c.status() != ContainerStatus::Running {
                return Ok(link);
            }

            let request = LinkRequest {
                volume: volume.clone(),
                source: v.path.clone(),
                target: link.target.clone(),
                read_only,
            };
            let placement = match self.builder.mount_link(container, c.root(), &request) {
                Ok(placement) => placement,
                Err(e) => {
                    self.links.discard(volume, container, &link.target);
                    return Err(e);
                }
            };
            self.links
                .mark_mounted(volume, container, &link.target, placement.clone())?;
            c.mounts_mut().links.push(placement);
            self.events().publish(RuntimeEvent::LinkMounted {
                volume: volume.to_string(),
                container: container.to_string(),
                target: link.target.display().to_string(),
                timestamp: now(),
            });
            Ok(link)
        })?;

        self.persist(&c)?;
        tracing::info!(%volume, %container, target = %link.target.display(), "Volume linked");
        Ok(self
            .links
            .for_container(container)
            .into_iter()
            .find(|l| &l.volume == volume && l.target == link.target)
            .unwrap_or(link))
    }

    /// Remove every link of `volume` to `container`, unmounting mounted ones.
    pub fn unlink(&self, volume: &VolumeId, container: &ContainerId) -> StowResult<()> {
        let handle = self.handle(container)?;
        let mut c = handle.lock();

        let (outgoing, others): (Vec<VolumeLink>, Vec<VolumeLink>) = self
            .links
            .for_container(container)
            .into_iter()
            .partition(|l| &l.volume == volume);
        if outgoing.is_empty() {
            return Err(StowError::LinkNotFound {
                volume: volume.to_string(),
                container: container.to_string(),
            });
        }

        // Links of other volumes mounted below an outgoing one go back to
        // created; a running container gets them again on its next start.
        let nested: Vec<&VolumeLink> = others
            .iter()
            .filter(|l| {
                l.placement.as_ref().is_some_and(|p| {
                    outgoing
                        .iter()
                        .filter_map(|o| o.placement.as_ref())
                        .any(|o| o.scope == p.scope && p.path != o.path && p.path.starts_with(&o.path))
                })
            })
            .collect();
        for link in nested.iter().rev() {
            if let Some(placement) = &link.placement {
                self.builder.unmount_link(placement)?;
                c.mounts_mut().links.retain(|p| p != placement);
                self.links.release(container, placement);
                self.link_unmounted(link);
            }
        }

        for link in outgoing.iter().rev() {
            if let Some(placement) = &link.placement {
                self.builder.unmount_link(placement)?;
                c.mounts_mut().links.retain(|p| p != placement);
                self.link_unmounted(link);
            }
        }

        let removed = self.links.remove(volume, container)?;
        self.persist(&c)?;
        tracing::info!(
            %volume,
            %container,
            count = removed.len(),
            released = nested.len(),
            "Volume unlinked"
        );
        Ok(())
    }

    fn link_unmounted(&self, link: &VolumeLink) {
        self.events().publish(RuntimeEvent::LinkUnmounted {
            volume: link.volume.to_string(),
            container: link.container.to_string(),
            target: link.target.display().to_string(),
            timestamp: now(),
        });
    }

    /// Links of a container in registration order.
    pub fn links(&self, container: &ContainerId) -> StowResult<Vec<VolumeLink>> {
        self.handle(container)?;
        Ok(self.links.for_container(container))
    }

    // Containers

    /// Register a stopped container.
    pub fn create_container(&self, name: &str) -> StowResult<ContainerId> {
        let id = ContainerId::new(name)?;
        let container = Container::new(id.clone());
        {
            let mut containers = self.containers.write();
            if containers.contains_key(&id) {
                return Err(StowError::Config {
                    message: format!("container {id} already exists"),
                });
            }
            containers.insert(id.clone(), Arc::new(Mutex::new(container.clone())));
        }
        self.persist(&container)?;
        tracing::info!(container = %id, "Container created");
        Ok(id)
    }

    /// Set the container root: a volume path or an existing directory.
    pub fn set_root(&self, id: &ContainerId, root: Option<PathBuf>) -> StowResult<()> {
        if let Some(root) = &root {
            let known = self.volumes.find_by_path(root).is_some() || root.is_dir();
            if !root.is_absolute() || !known {
                return Err(StowError::Config {
                    message: format!("root {} is not a volume or directory", root.display()),
                });
            }
        }
        let handle = self.handle(id)?;
        let mut c = handle.lock();
        c.set_root(root)?;
        self.persist(&c)
    }

    /// Replace the container's bind specs.
    pub fn set_binds(&self, id: &ContainerId, binds: Vec<BindSpec>) -> StowResult<()> {
        let handle = self.handle(id)?;
        let mut c = handle.lock();
        c.set_binds(binds)?;
        self.persist(&c)
    }

    /// Create, configure and start a container.
    pub fn run(
        &self,
        name: &str,
        root: Option<PathBuf>,
        binds: Vec<BindSpec>,
    ) -> StowResult<ContainerId> {
        let id = self.create_container(name)?;
        self.set_root(&id, root)?;
        self.set_binds(&id, binds)?;
        self.start(&id)?;
        Ok(id)
    }

    /// Build the container's namespace and mount its links.
    pub fn start(&self, id: &ContainerId) -> StowResult<()> {
        let handle = self.handle(id)?;
        let mut c = handle.lock();
        c.status().transition(id, LifecycleEvent::Start)?;

        let links = self.links.for_container(id);
        let requests = links
            .iter()
            .map(|l| {
                Ok(LinkRequest {
                    volume: l.volume.clone(),
                    source: self.volumes.get(&l.volume)?.path,
                    target: l.target.clone(),
                    read_only: l.read_only,
                })
            })
            .collect::<StowResult<Vec<_>>>()?;

        let mounts = self.builder.start(&NamespaceContext {
            id,
            root: c.root(),
            binds: c.binds(),
            links: &requests,
        })?;
        for (link, placement) in links.iter().zip(&mounts.links) {
            self.links
                .mark_mounted(&link.volume, id, &link.target, placement.clone())?;
        }
        c.set_mounts(mounts);
        c.transition(LifecycleEvent::Start)?;
        self.persist(&c)?;

        tracing::info!(container = %id, "Container started");
        self.events().publish(RuntimeEvent::ContainerStarted {
            id: id.to_string(),
            timestamp: now(),
        });
        Ok(())
    }

    /// Tear the container's namespace down. Host-side volumes stay.
    pub fn stop(&self, id: &ContainerId) -> StowResult<()> {
        let handle = self.handle(id)?;
        let mut c = handle.lock();
        self.stop_locked(&mut c)
    }

    fn stop_locked(&self, c: &mut Container) -> StowResult<()> {
        let id = c.id().clone();
        c.status().transition(&id, LifecycleEvent::Stop)?;

        self.builder.stop(&id, c.mounts())?;
        for link in self.links.for_container(&id) {
            if link.state == LinkState::Mounted {
                self.link_unmounted(&link);
            }
        }
        self.links.mark_unmounted(&id);
        c.take_mounts();
        c.transition(LifecycleEvent::Stop)?;
        self.persist(c)?;

        tracing::info!(container = %id, "Container stopped");
        self.events().publish(RuntimeEvent::ContainerStopped {
            id: id.to_string(),
            timestamp: now(),
        });
        Ok(())
    }

    /// Stop if running, drop links and ownership, and destroy volumes left
    /// without owners, deepest mount point first.
    pub fn destroy(&self, id: &ContainerId) -> StowResult<()> {
        let handle = self.handle(id)?;
        {
            let mut c = handle.lock();
            c.status().transition(id, LifecycleEvent::Destroy)?;
            if c.status() == ContainerStatus::Running {
                self.stop_locked(&mut c)?;
            }
            self.links.forget(id);
            c.transition(LifecycleEvent::Destroy)?;
        }
        self.containers.write().remove(id);
        self.state.delete(id)?;

        let mut orphans = Vec::new();
        for volume in self.volumes.list() {
            if volume.owners.contains(id) && self.volumes.remove_owner(&volume.id, id)? {
                orphans.push(volume);
            }
        }
        orphans.sort_by_key(|v| Reverse(v.path.components().count()));
        for volume in orphans {
            tracing::debug!(volume = %volume.id, container = %id, "Destroying orphaned volume");
            self.destroy_volume(&volume.id)?;
        }

        tracing::info!(container = %id, "Container destroyed");
        self.events().publish(RuntimeEvent::ContainerDestroyed {
            id: id.to_string(),
            timestamp: now(),
        });
        Ok(())
    }

    /// Current status of a container.
    pub fn status(&self, id: &ContainerId) -> StowResult<ContainerStatus> {
        Ok(self.handle(id)?.lock().status())
    }

    /// A copy of a container record.
    pub fn container(&self, id: &ContainerId) -> StowResult<Container> {
        Ok(self.handle(id)?.lock().clone())
    }

    /// All containers, ordered by id.
    #[must_use]
    pub fn containers(&self) -> Vec<Container> {
        let handles: Vec<_> = self.containers.read().values().cloned().collect();
        let mut out: Vec<Container> = handles.iter().map(|h| h.lock().clone()).collect();
        out.sort_by(|a, b| a.id().cmp(b.id()));
        out
    }

    /// Snapshot the mount table of a namespace. Takes no container lock.
    pub fn mounts(&self, scope: &Scope) -> StowResult<MountTable> {
        self.mounter.snapshot(scope)
    }
}

/// Make the staging directory a private mount so nothing staged there
/// propagates before it is finished.
fn prepare_staging(mounter: &dyn Mounter, staging: &Path) -> StowResult<()> {
    let host = Scope::Host;
    if !mounter.snapshot(&host)?.contains(staging) {
        mounter.bind(&host, staging, staging, false)?;
    }
    mounter.set_propagation(&host, staging, Propagation::Private, false)?;
    tracing::debug!(staging = %staging.display(), "Staging point ready");
    Ok(())
}
