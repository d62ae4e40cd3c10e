//! In-memory model of the kernel mount tree.
//!
//! [`PropagationGraph`] keeps every mount of every namespace as a node with a
//! parent, a mount point, the filesystem it exposes (`device` plus `root`
//! directory) and its propagation state: the peer group it shares with and
//! the peer group it receives from. Operations follow the kernel's
//! shared-subtree rules so the volume and namespace code can be driven and
//! observed without privileges.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Component, Path, PathBuf};

use parking_lot::Mutex;
use stow_common::{ContainerId, StowError, StowResult};

use crate::mount::{
    Filesystem, MountEntry, MountFlags, MountTable, Mounter, PeerGroupId, Propagation, Scope,
    UnmountFlags,
};

const EINVAL: i32 = 22;
const ELOOP: i32 = 40;

#[derive(Debug, Clone)]
struct MountNode {
    id: u64,
    ns: Scope,
    parent: Option<u64>,
    /// Attach order among siblings; later attaches sit on top.
    seq: u64,
    mountpoint: PathBuf,
    device: u32,
    root: PathBuf,
    fstype: String,
    source: String,
    flags: MountFlags,
    shared: Option<PeerGroupId>,
    master: Option<PeerGroupId>,
    /// The mount this one was propagated or namespace-copied from.
    origin: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
enum CopyMode {
    /// The copy joins the source's peer group and keeps its master.
    Join,
    /// The copy receives from the source; `reshare` gives it a fresh group.
    Slave { reshare: bool },
}

#[derive(Debug, Default)]
struct GraphState {
    nodes: BTreeMap<u64, MountNode>,
    next_id: u64,
    next_seq: u64,
    next_group: u32,
    next_device: u32,
}

/// A simulated mount tree with peer groups and master/slave edges.
#[derive(Debug)]
pub struct PropagationGraph {
    state: Mutex<GraphState>,
}

impl Default for PropagationGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl PropagationGraph {
    /// A graph whose host namespace looks like a typical systemd host:
    /// everything shared, cgroup v1 controllers under `/sys/fs/cgroup`.
    #[must_use]
    pub fn new() -> Self {
        let mut state = GraphState::default();

        let pseudo = MountFlags::pseudo(false);
        let root = state.seed(None, "/", "ext4", "/dev/sda1", MountFlags::rw());
        let dev = state.seed(
            Some(root),
            "/dev",
            "devtmpfs",
            "udev",
            MountFlags {
                nosuid: true,
                ..MountFlags::rw()
            },
        );
        state.seed(
            Some(dev),
            "/dev/pts",
            "devpts",
            "devpts",
            MountFlags {
                nosuid: true,
                noexec: true,
                ..MountFlags::rw()
            },
        );
        state.seed(Some(dev), "/dev/shm", "tmpfs", "tmpfs", MountFlags::volume(false));
        state.seed(Some(root), "/run", "tmpfs", "tmpfs", MountFlags::volume(false));
        let sys = state.seed(Some(root), "/sys", "sysfs", "sysfs", pseudo);
        let cgroup = state.seed(
            Some(sys),
            "/sys/fs/cgroup",
            "tmpfs",
            "tmpfs",
            MountFlags::pseudo(true),
        );
        state.seed(Some(cgroup), "/sys/fs/cgroup/cpu", "cgroup", "cgroup", pseudo);
        state.seed(Some(cgroup), "/sys/fs/cgroup/memory", "cgroup", "cgroup", pseudo);
        state.seed(Some(root), "/proc", "proc", "proc", pseudo);

        Self {
            state: Mutex::new(state),
        }
    }

    /// Namespaces currently modelled.
    #[must_use]
    pub fn scopes(&self) -> Vec<Scope> {
        let state = self.state.lock();
        state
            .nodes
            .values()
            .filter(|n| n.parent.is_none())
            .map(|n| n.ns.clone())
            .collect()
    }
}

impl GraphState {
    fn seed(
        &mut self,
        parent: Option<u64>,
        path: &str,
        fstype: &str,
        source: &str,
        flags: MountFlags,
    ) -> u64 {
        let id = self.alloc_id();
        let seq = self.alloc_seq();
        let device = self.fresh_device();
        let group = self.fresh_group();
        self.nodes.insert(
            id,
            MountNode {
                id,
                ns: Scope::Host,
                parent,
                seq,
                mountpoint: PathBuf::from(path),
                device,
                root: PathBuf::from("/"),
                fstype: fstype.to_string(),
                source: source.to_string(),
                flags,
                shared: Some(group),
                master: None,
                origin: None,
            },
        );
        id
    }

    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn alloc_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn fresh_group(&mut self) -> PeerGroupId {
        self.next_group += 1;
        PeerGroupId(self.next_group)
    }

    fn fresh_device(&mut self) -> u32 {
        self.next_device += 1;
        self.next_device
    }

    fn node(&self, id: u64) -> StowResult<&MountNode> {
        self.nodes.get(&id).ok_or_else(|| StowError::Internal {
            message: format!("mount {id} vanished from the graph"),
        })
    }

    fn node_mut(&mut self, id: u64) -> StowResult<&mut MountNode> {
        self.nodes.get_mut(&id).ok_or_else(|| StowError::Internal {
            message: format!("mount {id} vanished from the graph"),
        })
    }

    fn root_of(&self, scope: &Scope) -> StowResult<u64> {
        self.nodes
            .values()
            .find(|n| n.parent.is_none() && &n.ns == scope)
            .map(|n| n.id)
            .ok_or_else(|| match scope {
                Scope::Host => StowError::Internal {
                    message: "host namespace has no root mount".to_string(),
                },
                Scope::Container(id) => StowError::ContainerNotFound { id: id.to_string() },
            })
    }

    fn children(&self, id: u64) -> Vec<u64> {
        let mut children: Vec<&MountNode> = self
            .nodes
            .values()
            .filter(|n| n.parent == Some(id))
            .collect();
        children.sort_by_key(|n| n.seq);
        children.into_iter().map(|n| n.id).collect()
    }

    /// `id` and everything mounted below it, parents before children.
    fn descendants(&self, id: u64) -> Vec<u64> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            out.push(next);
            let mut children = self.children(next);
            children.reverse();
            stack.extend(children);
        }
        out
    }

    /// The mount a path walk for `path` ends on.
    fn lookup(&self, scope: &Scope, path: &Path) -> StowResult<u64> {
        let mut current = self.root_of(scope)?;
        loop {
            // Mounts stacked on `current` cover everything; otherwise the
            // shallowest child on the way hides deeper siblings.
            let next = self
                .nodes
                .values()
                .filter(|n| n.parent == Some(current) && path.starts_with(&n.mountpoint))
                .min_by(|a, b| {
                    a.mountpoint
                        .components()
                        .count()
                        .cmp(&b.mountpoint.components().count())
                        .then(b.seq.cmp(&a.seq))
                });
            match next {
                Some(n) => current = n.id,
                None => return Ok(current),
            }
        }
    }

    /// The mount exactly at `path`, or `EINVAL` when `path` is not a mount point.
    fn mount_at(&self, scope: &Scope, path: &Path, operation: &'static str) -> StowResult<u64> {
        let id = self.lookup(scope, path)?;
        if self.node(id)?.mountpoint != path {
            return Err(invalid(operation, path));
        }
        Ok(id)
    }

    /// Every mount receiving propagation from `group`, peers included.
    fn receivers(&self, group: PeerGroupId) -> HashSet<u64> {
        let mut groups = HashSet::from([group]);
        let mut members = HashSet::new();
        loop {
            let before = (groups.len(), members.len());
            for n in self.nodes.values() {
                let joined = n.shared.is_some_and(|g| groups.contains(&g));
                let slaved = n.master.is_some_and(|g| groups.contains(&g));
                if joined || slaved {
                    members.insert(n.id);
                    if let Some(g) = n.shared {
                        groups.insert(g);
                    }
                }
            }
            if (groups.len(), members.len()) == before {
                return members;
            }
        }
    }

    /// Where the filesystem location `fs_path` on `device` shows up through mount `id`.
    fn translate(&self, id: u64, device: u32, fs_path: &Path) -> StowResult<Option<PathBuf>> {
        let node = self.node(id)?;
        if node.device != device {
            return Ok(None);
        }
        Ok(fs_path
            .strip_prefix(&node.root)
            .ok()
            .map(|rel| rebase(&node.mountpoint, rel)))
    }

    fn snapshot(&self, scope: &Scope) -> StowResult<MountTable> {
        let root = self.root_of(scope)?;
        let mut entries = Vec::new();
        for id in self.descendants(root) {
            let n = self.node(id)?;
            entries.push(MountEntry {
                mount_id: n.id,
                parent_id: n.parent.unwrap_or(n.id),
                root: n.root.clone(),
                path: n.mountpoint.clone(),
                flags: n.flags.options(),
                shared: n.shared,
                master: n.master,
                fstype: n.fstype.clone(),
                source: n.source.clone(),
            });
        }
        Ok(MountTable::from_entries(entries))
    }

    fn insert(&mut self, mut node: MountNode) -> u64 {
        let id = self.alloc_id();
        node.id = id;
        node.seq = self.alloc_seq();
        self.nodes.insert(id, node);
        id
    }

    /// Finish attaching the tree rooted at `top` (already linked to its
    /// parent) and propagate copies of it.
    fn attach(&mut self, top: u64) -> StowResult<()> {
        let top_node = self.node(top)?;
        let parent_id = top_node.parent.ok_or_else(|| StowError::Internal {
            message: "attached tree has no parent".to_string(),
        })?;
        let mountpoint = top_node.mountpoint.clone();
        let parent = self.node(parent_id)?.clone();

        let Some(group) = parent.shared else {
            return Ok(());
        };

        // Anything attached below a shared mount becomes shared itself.
        let template = self.descendants(top);
        for &id in &template {
            if self.node(id)?.shared.is_none() {
                let fresh = self.fresh_group();
                self.node_mut(id)?.shared = Some(fresh);
            }
        }

        let rel = mountpoint.strip_prefix(&parent.mountpoint).unwrap_or(Path::new(""));
        let fs_path = rebase(&parent.root, rel);
        let mut exclude: HashSet<u64> = template.iter().copied().collect();
        exclude.insert(parent_id);
        let mut visited = HashSet::new();
        self.propagate_group(
            group,
            parent.device,
            &fs_path,
            &template,
            &mut exclude,
            &mut visited,
        )
    }

    fn propagate_group(
        &mut self,
        group: PeerGroupId,
        device: u32,
        fs_path: &Path,
        template: &[u64],
        exclude: &mut HashSet<u64>,
        visited: &mut HashSet<PeerGroupId>,
    ) -> StowResult<()> {
        if !visited.insert(group) {
            return Ok(());
        }

        let peers: Vec<u64> = self
            .nodes
            .values()
            .filter(|n| n.shared == Some(group) && !exclude.contains(&n.id))
            .map(|n| n.id)
            .collect();
        for peer in peers {
            if let Some(loc) = self.translate(peer, device, fs_path)? {
                let copies = self.copy_tree(template, peer, &loc, CopyMode::Join)?;
                exclude.extend(copies);
            }
        }

        let slaves: Vec<(u64, Option<PeerGroupId>)> = self
            .nodes
            .values()
            .filter(|n| n.master == Some(group) && !exclude.contains(&n.id))
            .map(|n| (n.id, n.shared))
            .collect();
        let mut seen_groups = HashSet::new();
        for (slave, slave_group) in slaves {
            let Some(loc) = self.translate(slave, device, fs_path)? else {
                continue;
            };
            match slave_group {
                Some(h) => {
                    if !seen_groups.insert(h) {
                        continue;
                    }
                    let copies =
                        self.copy_tree(template, slave, &loc, CopyMode::Slave { reshare: true })?;
                    exclude.insert(slave);
                    exclude.extend(copies.iter().copied());
                    self.propagate_group(h, device, fs_path, &copies, exclude, visited)?;
                }
                None => {
                    let copies =
                        self.copy_tree(template, slave, &loc, CopyMode::Slave { reshare: false })?;
                    exclude.extend(copies);
                }
            }
        }
        Ok(())
    }

    /// Copy the tree `template` (preorder) onto `under` at `loc`.
    fn copy_tree(
        &mut self,
        template: &[u64],
        under: u64,
        loc: &Path,
        mode: CopyMode,
    ) -> StowResult<Vec<u64>> {
        let Some(&top) = template.first() else {
            return Ok(Vec::new());
        };
        let top_mountpoint = self.node(top)?.mountpoint.clone();
        let ns = self.node(under)?.ns.clone();

        let mut mapping: HashMap<u64, u64> = HashMap::new();
        let mut created = Vec::with_capacity(template.len());
        for &src_id in template {
            let src = self.node(src_id)?.clone();
            let parent = if src_id == top {
                under
            } else {
                src.parent
                    .and_then(|p| mapping.get(&p).copied())
                    .ok_or_else(|| StowError::Internal {
                        message: format!("mount {src_id} copied before its parent"),
                    })?
            };
            let (shared, master) = match mode {
                CopyMode::Join => (src.shared, src.master),
                CopyMode::Slave { reshare } => {
                    let shared = if reshare {
                        Some(self.fresh_group())
                    } else {
                        None
                    };
                    (shared, src.shared.or(src.master))
                }
            };
            let mountpoint = rebase(
                loc,
                src.mountpoint.strip_prefix(&top_mountpoint).unwrap_or(Path::new("")),
            );
            let id = self.insert(MountNode {
                ns: ns.clone(),
                parent: Some(parent),
                mountpoint,
                shared,
                master,
                origin: Some(src_id),
                ..src
            });
            mapping.insert(src_id, id);
            created.push(id);
        }
        Ok(created)
    }

    fn make_slave(&mut self, id: u64) -> StowResult<()> {
        let node = self.node(id)?;
        let Some(group) = node.shared else {
            return Ok(());
        };
        let own_master = node.master;
        let has_peers = self
            .nodes
            .values()
            .any(|n| n.id != id && n.shared == Some(group));
        if has_peers {
            self.node_mut(id)?.master = Some(group);
        } else {
            // The group dissolves; its slaves move up to our master.
            for n in self.nodes.values_mut() {
                if n.master == Some(group) {
                    n.master = own_master;
                }
            }
        }
        self.node_mut(id)?.shared = None;
        Ok(())
    }

    fn change_propagation(&mut self, id: u64, propagation: Propagation) -> StowResult<()> {
        match propagation {
            Propagation::Shared => {
                if self.node(id)?.shared.is_none() {
                    let fresh = self.fresh_group();
                    self.node_mut(id)?.shared = Some(fresh);
                }
            }
            Propagation::Slave => self.make_slave(id)?,
            Propagation::Private => {
                self.make_slave(id)?;
                self.node_mut(id)?.master = None;
            }
        }
        Ok(())
    }

    /// Drop a mount, handing its slaves on if its peer group dies with it.
    fn remove(&mut self, id: u64) -> StowResult<()> {
        self.make_slave(id)?;
        self.nodes.remove(&id);
        Ok(())
    }

    fn unmount(&mut self, scope: &Scope, target: &Path, flags: UnmountFlags) -> StowResult<()> {
        let id = self.mount_at(scope, target, "umount")?;
        if self.node(id)?.parent.is_none() {
            return Err(busy(target));
        }
        if !flags.detach && !self.children(id).is_empty() {
            return Err(busy(target));
        }

        let mut doomed: BTreeSet<u64> = if flags.detach {
            self.descendants(id).into_iter().collect()
        } else {
            BTreeSet::from([id])
        };

        // Unmounts propagate to copies sitting on receivers of the parent's group.
        let mut work: Vec<u64> = doomed.iter().copied().collect();
        while let Some(removed) = work.pop() {
            let Some(parent) = self.node(removed)?.parent else {
                continue;
            };
            let Some(group) = self.node(parent)?.shared else {
                continue;
            };
            let receivers = self.receivers(group);
            let copies: Vec<u64> = self
                .nodes
                .values()
                .filter(|n| {
                    n.origin == Some(removed)
                        && n.parent.is_some_and(|p| receivers.contains(&p))
                        && !doomed.contains(&n.id)
                })
                .map(|n| n.id)
                .collect();
            for copy in copies {
                let subtree = self.descendants(copy);
                if flags.detach {
                    for d in subtree {
                        if doomed.insert(d) {
                            work.push(d);
                        }
                    }
                } else if subtree.len() == 1 {
                    doomed.insert(copy);
                    work.push(copy);
                }
            }
        }

        for id in doomed {
            self.remove(id)?;
        }
        Ok(())
    }

    fn bind(
        &mut self,
        scope: &Scope,
        source: &Path,
        target: &Path,
        recursive: bool,
    ) -> StowResult<()> {
        let src_id = self.lookup(scope, source)?;
        let dest_parent = self.lookup(scope, target)?;

        let template = if recursive {
            // Sub-mounts inside the bound directory come along.
            self.descendants(src_id)
                .into_iter()
                .filter(|&id| {
                    id == src_id
                        || self
                            .nodes
                            .get(&id)
                            .is_some_and(|n| n.mountpoint.starts_with(source))
                })
                .collect::<Vec<_>>()
        } else {
            vec![src_id]
        };

        let src = self.node(src_id)?.clone();
        let rel = source.strip_prefix(&src.mountpoint).unwrap_or(Path::new(""));
        let mut mapping: HashMap<u64, u64> = HashMap::new();
        let mut top = None;
        for &id in &template {
            let n = self.node(id)?.clone();
            let (parent, mountpoint, root) = if id == src_id {
                (dest_parent, target.to_path_buf(), rebase(&n.root, rel))
            } else {
                let Some(parent) = n.parent.and_then(|p| mapping.get(&p).copied()) else {
                    continue;
                };
                let below = n.mountpoint.strip_prefix(source).unwrap_or(Path::new(""));
                (parent, rebase(target, below), n.root.clone())
            };
            // A bind of a shared mount joins its group; a bind of a slave keeps the master.
            let copy = self.insert(MountNode {
                ns: scope.clone(),
                parent: Some(parent),
                mountpoint,
                root,
                origin: None,
                ..n
            });
            mapping.insert(id, copy);
            top.get_or_insert(copy);
        }

        match top {
            Some(top) => self.attach(top),
            None => Ok(()),
        }
    }

    fn move_mount(&mut self, scope: &Scope, source: &Path, target: &Path) -> StowResult<()> {
        let src_id = self.mount_at(scope, source, "move")?;
        let Some(old_parent) = self.node(src_id)?.parent else {
            return Err(invalid("move", source));
        };
        if self.node(old_parent)?.shared.is_some() {
            return Err(invalid("move", source));
        }
        let dest_parent = self.lookup(scope, target)?;
        let tree = self.descendants(src_id);
        if tree.contains(&dest_parent) {
            return Err(StowError::syscall(
                "move",
                target,
                std::io::Error::from_raw_os_error(ELOOP),
            ));
        }

        for &id in &tree {
            let node = self.node_mut(id)?;
            let below = node
                .mountpoint
                .strip_prefix(source)
                .map(Path::to_path_buf)
                .unwrap_or_default();
            node.mountpoint = rebase(target, &below);
        }
        let seq = self.alloc_seq();
        let top = self.node_mut(src_id)?;
        top.parent = Some(dest_parent);
        top.seq = seq;

        self.attach(src_id)
    }

    fn create_namespace(&mut self, id: &ContainerId) -> StowResult<()> {
        let scope = Scope::Container(id.clone());
        if self.root_of(&scope).is_ok() {
            return Err(StowError::Internal {
                message: format!("namespace for {id} already exists"),
            });
        }

        let host_root = self.root_of(&Scope::Host)?;
        let mut mapping: HashMap<u64, u64> = HashMap::new();
        let mut new_root = None;
        for host_id in self.descendants(host_root) {
            let host = self.node(host_id)?.clone();
            let parent = host.parent.and_then(|p| mapping.get(&p).copied());
            let copy = self.insert(MountNode {
                ns: scope.clone(),
                parent,
                origin: Some(host_id),
                ..host
            });
            mapping.insert(host_id, copy);
            new_root.get_or_insert(copy);
        }

        // The copies start as peers of the host mounts; make them receive only.
        if let Some(root) = new_root {
            for copy in self.descendants(root) {
                self.make_slave(copy)?;
            }
        }
        Ok(())
    }

    fn pivot_root(&mut self, id: &ContainerId, new_root: &Path) -> StowResult<()> {
        let scope = Scope::Container(id.clone());
        let new_id = self.mount_at(&scope, new_root, "pivot_root")?;
        let old_root = self.root_of(&scope)?;
        if new_id == old_root {
            return Err(busy(new_root));
        }
        let new_parent = self.node(new_id)?.parent;
        let parent_shared = match new_parent {
            Some(p) => self.node(p)?.shared.is_some(),
            None => false,
        };
        if self.node(old_root)?.shared.is_some() || parent_shared {
            return Err(invalid("pivot_root", new_root));
        }

        let keep: HashSet<u64> = self.descendants(new_id).into_iter().collect();
        let dropped: Vec<u64> = self
            .nodes
            .values()
            .filter(|n| n.ns == scope && !keep.contains(&n.id))
            .map(|n| n.id)
            .collect();
        for id in dropped {
            self.remove(id)?;
        }

        for &id in &keep {
            let node = self.node_mut(id)?;
            let below = node
                .mountpoint
                .strip_prefix(new_root)
                .map(Path::to_path_buf)
                .unwrap_or_default();
            node.mountpoint = rebase(Path::new("/"), &below);
        }
        self.node_mut(new_id)?.parent = None;
        Ok(())
    }
}

impl Mounter for PropagationGraph {
    fn mount_fs(
        &self,
        scope: &Scope,
        fs: &Filesystem,
        target: &Path,
        flags: MountFlags,
    ) -> StowResult<()> {
        let target = clean(target, "mount")?;
        tracing::debug!(%scope, fstype = %fs.fstype, target = %target.display(), "Mounting filesystem");

        let mut state = self.state.lock();
        let parent = state.lookup(scope, &target)?;
        let device = state.fresh_device();
        let top = state.insert(MountNode {
            id: 0,
            ns: scope.clone(),
            parent: Some(parent),
            seq: 0,
            mountpoint: target,
            device,
            root: PathBuf::from("/"),
            fstype: fs.fstype.clone(),
            source: fs.source.clone(),
            flags,
            shared: None,
            master: None,
            origin: None,
        });
        state.attach(top)
    }

    fn bind(
        &self,
        scope: &Scope,
        source: &Path,
        target: &Path,
        recursive: bool,
    ) -> StowResult<()> {
        let source = clean(source, "bind")?;
        let target = clean(target, "bind")?;
        tracing::debug!(
            %scope,
            source = %source.display(),
            target = %target.display(),
            recursive,
            "Creating bind mount"
        );
        self.state.lock().bind(scope, &source, &target, recursive)
    }

    fn remount(&self, scope: &Scope, target: &Path, flags: MountFlags) -> StowResult<()> {
        let target = clean(target, "remount")?;
        tracing::debug!(%scope, target = %target.display(), ?flags, "Remounting");
        let mut state = self.state.lock();
        let id = state.mount_at(scope, &target, "remount")?;
        state.node_mut(id)?.flags = flags;
        Ok(())
    }

    fn set_propagation(
        &self,
        scope: &Scope,
        target: &Path,
        propagation: Propagation,
        recursive: bool,
    ) -> StowResult<()> {
        let target = clean(target, "propagation")?;
        tracing::debug!(
            %scope,
            target = %target.display(),
            ?propagation,
            recursive,
            "Changing propagation"
        );
        let mut state = self.state.lock();
        let id = state.mount_at(scope, &target, "propagation")?;
        let ids = if recursive {
            state.descendants(id)
        } else {
            vec![id]
        };
        for id in ids {
            state.change_propagation(id, propagation)?;
        }
        Ok(())
    }

    fn move_mount(&self, scope: &Scope, source: &Path, target: &Path) -> StowResult<()> {
        let source = clean(source, "move")?;
        let target = clean(target, "move")?;
        tracing::debug!(
            %scope,
            source = %source.display(),
            target = %target.display(),
            "Moving mount"
        );
        self.state.lock().move_mount(scope, &source, &target)
    }

    fn unmount(&self, scope: &Scope, target: &Path, flags: UnmountFlags) -> StowResult<()> {
        let target = clean(target, "umount")?;
        tracing::debug!(%scope, target = %target.display(), ?flags, "Unmounting filesystem");
        self.state.lock().unmount(scope, &target, flags)
    }

    fn create_namespace(&self, id: &ContainerId) -> StowResult<()> {
        tracing::debug!(container = %id, "Creating mount namespace");
        self.state.lock().create_namespace(id)
    }

    fn pivot_root(&self, id: &ContainerId, new_root: &Path) -> StowResult<()> {
        let new_root = clean(new_root, "pivot_root")?;
        tracing::debug!(container = %id, new_root = %new_root.display(), "Executing pivot_root");
        self.state.lock().pivot_root(id, &new_root)
    }

    fn destroy_namespace(&self, id: &ContainerId) -> StowResult<()> {
        tracing::debug!(container = %id, "Destroying mount namespace");
        let scope = Scope::Container(id.clone());
        let mut state = self.state.lock();
        let ids: Vec<u64> = state
            .nodes
            .values()
            .filter(|n| n.ns == scope)
            .map(|n| n.id)
            .collect();
        for mount in ids {
            state.remove(mount)?;
        }
        Ok(())
    }

    fn snapshot(&self, scope: &Scope) -> StowResult<MountTable> {
        self.state.lock().snapshot(scope)
    }
}

fn invalid(operation: &'static str, path: &Path) -> StowError {
    StowError::syscall(operation, path, std::io::Error::from_raw_os_error(EINVAL))
}

fn busy(path: &Path) -> StowError {
    StowError::MountBusy {
        path: path.to_path_buf(),
    }
}

/// `base` joined with `rel`, without a trailing separator for an empty `rel`.
fn rebase(base: &Path, rel: &Path) -> PathBuf {
    if rel.as_os_str().is_empty() {
        base.to_path_buf()
    } else {
        base.join(rel)
    }
}

/// Lexically normalize an absolute path.
fn clean(path: &Path, operation: &'static str) -> StowResult<PathBuf> {
    if !path.is_absolute() {
        return Err(invalid(operation, path));
    }
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    Ok(out)
}
