//! Volume-to-container links.
//!
//! A link asks for a volume to be shown inside a container at a target path.
//! The registry only tracks links and their state; mounting them is the
//! namespace builder's job.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use stow_common::{ContainerId, StowError, StowResult, VolumeId};

use crate::namespace::LinkPlacement;

/// Link states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// Registered, not mounted.
    #[default]
    Created,
    /// Mounted into a running container.
    Mounted,
    /// Unlinked; terminal.
    Destroyed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Mounted => write!(f, "mounted"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// One link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeLink {
    /// Linked volume.
    pub volume: VolumeId,
    /// Container showing it.
    pub container: ContainerId,
    /// Path inside the container.
    pub target: PathBuf,
    /// Mount read-only.
    pub read_only: bool,
    /// Current state.
    #[serde(default)]
    pub state: LinkState,
    /// Where the link is mounted while [`LinkState::Mounted`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<LinkPlacement>,
}

impl VolumeLink {
    /// A fresh, unmounted link.
    #[must_use]
    pub fn new(volume: VolumeId, container: ContainerId, target: PathBuf, read_only: bool) -> Self {
        Self {
            volume,
            container,
            target,
            read_only,
            state: LinkState::Created,
            placement: None,
        }
    }

    fn same_as(&self, volume: &VolumeId, target: &std::path::Path) -> bool {
        &self.volume == volume && self.target == target
    }

    /// Created -> Mounted.
    pub(crate) fn mounted(&mut self, placement: LinkPlacement) -> StowResult<()> {
        self.require(LinkState::Created, "mount")?;
        self.state = LinkState::Mounted;
        self.placement = Some(placement);
        Ok(())
    }

    /// Mounted -> Created. No-op for a link that is not mounted.
    pub(crate) fn unmounted(&mut self) -> Option<LinkPlacement> {
        if self.state == LinkState::Mounted {
            self.state = LinkState::Created;
        }
        self.placement.take()
    }

    /// Any state -> Destroyed.
    pub(crate) fn destroyed(&mut self) -> Option<LinkPlacement> {
        self.state = LinkState::Destroyed;
        self.placement.take()
    }

    fn require(&self, state: LinkState, operation: &'static str) -> StowResult<()> {
        if self.state == state {
            return Ok(());
        }
        Err(StowError::InvalidState {
            id: format!("{}:{}", self.volume, self.container),
            state: self.state.to_string(),
            operation,
        })
    }
}

type Links = Arc<Mutex<Vec<VolumeLink>>>;

/// Links by container, in registration order.
#[derive(Debug, Default)]
pub struct LinkRegistry {
    links: RwLock<HashMap<ContainerId, Links>>,
}

impl LinkRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, container: &ContainerId) -> Links {
        if let Some(links) = self.links.read().get(container) {
            return links.clone();
        }
        self.links
            .write()
            .entry(container.clone())
            .or_default()
            .clone()
    }

    /// Replace a container's links, as loaded from disk.
    pub fn restore(&self, container: &ContainerId, links: Vec<VolumeLink>) {
        self.links
            .write()
            .insert(container.clone(), Arc::new(Mutex::new(links)));
    }

    /// Register a link. The same volume, container and target twice is a conflict.
    pub fn add(
        &self,
        volume: &VolumeId,
        container: &ContainerId,
        target: PathBuf,
        read_only: bool,
    ) -> StowResult<VolumeLink> {
        let links = self.entry(container);
        let mut links = links.lock();
        if links.iter().any(|l| l.same_as(volume, &target)) {
            return Err(StowError::LinkExists {
                volume: volume.to_string(),
                container: container.to_string(),
                target,
            });
        }
        let link = VolumeLink::new(volume.clone(), container.clone(), target, read_only);
        links.push(link.clone());
        Ok(link)
    }

    /// Record where a registered link got mounted.
    pub fn mark_mounted(
        &self,
        volume: &VolumeId,
        container: &ContainerId,
        target: &std::path::Path,
        placement: LinkPlacement,
    ) -> StowResult<()> {
        let links = self.entry(container);
        let mut links = links.lock();
        let link = links
            .iter_mut()
            .find(|l| l.same_as(volume, target))
            .ok_or_else(|| StowError::LinkNotFound {
                volume: volume.to_string(),
                container: container.to_string(),
            })?;
        link.mounted(placement)
    }

    /// Drop a link that never got mounted.
    pub fn discard(&self, volume: &VolumeId, container: &ContainerId, target: &std::path::Path) {
        self.entry(container)
            .lock()
            .retain(|l| !l.same_as(volume, target));
    }

    /// Mark every link of a stopped container as created again.
    pub fn mark_unmounted(&self, container: &ContainerId) {
        for link in self.entry(container).lock().iter_mut() {
            link.unmounted();
        }
    }

    /// Mark the link mounted at `placement` as created again.
    pub fn release(&self, container: &ContainerId, placement: &LinkPlacement) {
        for link in self.entry(container).lock().iter_mut() {
            if link.placement.as_ref() == Some(placement) {
                link.unmounted();
            }
        }
    }

    /// Remove every link of `volume` to `container`, returned as destroyed
    /// with the placement each one was mounted at.
    pub fn remove(
        &self,
        volume: &VolumeId,
        container: &ContainerId,
    ) -> StowResult<Vec<(VolumeLink, Option<LinkPlacement>)>> {
        let links = self.entry(container);
        let mut links = links.lock();
        let (mut removed, kept): (Vec<_>, Vec<_>) =
            links.drain(..).partition(|l| &l.volume == volume);
        *links = kept;
        if removed.is_empty() {
            return Err(StowError::LinkNotFound {
                volume: volume.to_string(),
                container: container.to_string(),
            });
        }
        Ok(removed
            .iter_mut()
            .map(|l| {
                let placement = l.destroyed();
                (l.clone(), placement)
            })
            .collect())
    }

    /// Forget a container entirely.
    pub fn forget(&self, container: &ContainerId) {
        self.links.write().remove(container);
    }

    /// A container's links in registration order.
    #[must_use]
    pub fn for_container(&self, container: &ContainerId) -> Vec<VolumeLink> {
        self.links
            .read()
            .get(container)
            .map(|l| l.lock().clone())
            .unwrap_or_default()
    }

    /// Containers linking `volume`.
    #[must_use]
    pub fn containers_of(&self, volume: &VolumeId) -> Vec<ContainerId> {
        let mut out: Vec<ContainerId> = self
            .links
            .read()
            .iter()
            .filter(|(_, links)| links.lock().iter().any(|l| &l.volume == volume))
            .map(|(c, _)| c.clone())
            .collect();
        out.sort();
        out
    }
}
