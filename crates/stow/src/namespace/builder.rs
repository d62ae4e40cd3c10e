//! Construction and teardown of a container's mount namespace.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stow_common::{ContainerId, StowPaths, StowResult, VolumeId};

use crate::bind::{BindResolver, BindSpec};
use crate::mount::{
    Filesystem, MountFlags, Mounter, Propagation, Scope, UnmountFlags, unmount_with_retry,
};
use crate::propagation::{ReadOnly, apply_flags, attach_appearance, publish_bind};

/// Read-only self-binds laid over the container's `/proc`.
const PROC_READ_ONLY: &[&str] = &["sysrq-trigger", "irq", "bus", "sys"];

/// Everything needed to build one container's namespace.
#[derive(Debug, Clone, Copy)]
pub struct NamespaceContext<'a> {
    /// Container id.
    pub id: &'a ContainerId,
    /// Host path of the container root, if chrooted.
    pub root: Option<&'a Path>,
    /// Bind specs in declared order.
    pub binds: &'a [BindSpec],
    /// Links to materialize after the namespace is up.
    pub links: &'a [LinkRequest],
}

/// A link to materialize: the volume's host path shown at `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRequest {
    /// Linked volume.
    pub volume: VolumeId,
    /// Host mount point of the volume.
    pub source: PathBuf,
    /// Path inside the container.
    pub target: PathBuf,
    /// Mount read-only.
    pub read_only: bool,
}

/// Where a link is currently mounted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPlacement {
    /// Namespace holding the mount.
    pub scope: Scope,
    /// Mount point in that namespace's coordinates.
    pub path: PathBuf,
}

/// Mounts a started namespace owns beyond its base system mounts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceMounts {
    /// Bind spec mount points, container coordinates, in mount order.
    pub binds: Vec<PathBuf>,
    /// Link placements, in mount order.
    pub links: Vec<LinkPlacement>,
}

/// Builds container namespaces on top of a [`Mounter`].
#[derive(Debug, Clone)]
pub struct NamespaceBuilder {
    mounter: Arc<dyn Mounter>,
    paths: StowPaths,
    resolver: BindResolver,
}

/// Mounts made so far by one start attempt.
#[derive(Default)]
struct Attempt {
    applied: Vec<(Scope, PathBuf)>,
    mounts: NamespaceMounts,
}

impl NamespaceBuilder {
    /// Create a builder.
    pub fn new(mounter: Arc<dyn Mounter>, paths: StowPaths, resolver: BindResolver) -> Self {
        Self {
            mounter,
            paths,
            resolver,
        }
    }

    /// Build the namespace for `ctx` and materialize its links.
    ///
    /// On failure everything this attempt mounted is unmounted again, the
    /// namespace is destroyed and the original error is returned.
    pub fn start(&self, ctx: &NamespaceContext<'_>) -> StowResult<NamespaceMounts> {
        self.mounter.create_namespace(ctx.id)?;

        let mut attempt = Attempt::default();
        match self.populate(ctx, &mut attempt) {
            Ok(()) => {
                tracing::debug!(
                    container = %ctx.id,
                    binds = attempt.mounts.binds.len(),
                    links = attempt.mounts.links.len(),
                    "Namespace ready"
                );
                Ok(attempt.mounts)
            }
            Err(err) => {
                tracing::warn!(container = %ctx.id, error = %err, "Start failed, rolling back");
                self.rollback(ctx.id, attempt);
                Err(err)
            }
        }
    }

    /// Unmount link placements and binds in reverse order, then drop the namespace.
    ///
    /// Mounts that are already gone are skipped. A failed unmount does not stop
    /// the teardown; the first error is returned once the namespace is destroyed.
    pub fn stop(&self, id: &ContainerId, mounts: &NamespaceMounts) -> StowResult<()> {
        let scope = Scope::Container(id.clone());
        let targets = mounts
            .links
            .iter()
            .rev()
            .map(|p| (&p.scope, p.path.as_path()))
            .chain(mounts.binds.iter().rev().map(|b| (&scope, b.as_path())));

        let mut failure = None;
        for (scope, path) in targets {
            if let Err(e) = self.unmount_present(scope, path) {
                tracing::warn!(
                    container = %id,
                    %scope,
                    target = %path.display(),
                    error = %e,
                    "Failed to unmount during stop"
                );
                failure.get_or_insert(e);
            }
        }
        if let Err(e) = self.mounter.destroy_namespace(id) {
            failure.get_or_insert(e);
        }

        match failure {
            Some(e) => Err(e),
            None => {
                tracing::debug!(container = %id, "Namespace destroyed");
                Ok(())
            }
        }
    }

    /// Mount one link for a started container.
    ///
    /// A chrooted container gets the link on the host under its root, from
    /// where it propagates in; otherwise it is bound inside the namespace.
    pub fn mount_link(
        &self,
        id: &ContainerId,
        root: Option<&Path>,
        link: &LinkRequest,
    ) -> StowResult<LinkPlacement> {
        let mounter = self.mounter.as_ref();
        let flags = MountFlags::volume(link.read_only);

        let placement = match root {
            Some(root) => {
                let path = self.resolver.resolve(root, &link.target)?;
                let slot = self
                    .paths
                    .staging_slot(&format!("{id}-{}", link.volume));
                std::fs::create_dir_all(&slot)?;
                let published = publish_bind(
                    mounter,
                    &Scope::Host,
                    &link.source,
                    &slot,
                    &path,
                    flags,
                    false,
                    ReadOnly::Keep,
                );
                if let Err(e) = std::fs::remove_dir(&slot) {
                    tracing::warn!(slot = %slot.display(), error = %e, "Failed to remove staging slot");
                }
                published?;
                LinkPlacement {
                    scope: Scope::Host,
                    path,
                }
            }
            None => {
                let scope = Scope::Container(id.clone());
                let path = self.resolver.resolve(Path::new("/"), &link.target)?;
                attach_appearance(mounter, &scope, &link.source, &path, flags, false)?;
                LinkPlacement { scope, path }
            }
        };

        tracing::debug!(
            container = %id,
            volume = %link.volume,
            scope = %placement.scope,
            target = %placement.path.display(),
            "Link mounted"
        );
        Ok(placement)
    }

    /// Unmount a link placement. A placement that is already gone is not an error.
    pub fn unmount_link(&self, placement: &LinkPlacement) -> StowResult<()> {
        self.unmount_present(&placement.scope, &placement.path)
    }

    fn unmount_present(&self, scope: &Scope, path: &Path) -> StowResult<()> {
        // A namespace that cannot be read any more holds nothing to unmount.
        let present = self
            .mounter
            .snapshot(scope)
            .is_ok_and(|table| table.contains(path));
        if !present {
            tracing::debug!(%scope, target = %path.display(), "Mount already gone");
            return Ok(());
        }
        unmount_with_retry(self.mounter.as_ref(), scope, path)
    }

    fn populate(&self, ctx: &NamespaceContext<'_>, attempt: &mut Attempt) -> StowResult<()> {
        let scope = Scope::Container(ctx.id.clone());
        let mounter = self.mounter.as_ref();
        let base = ctx.root.unwrap_or(Path::new("/"));
        let chrooted = ctx.root.is_some();

        if let Some(root) = ctx.root {
            mounter.bind(&scope, root, root, true)?;
            attempt.applied.push((scope.clone(), root.to_path_buf()));
            let root_flags = MountFlags {
                nodev: true,
                ..MountFlags::rw()
            };
            apply_flags(mounter, &scope, root, root_flags, false, ReadOnly::Keep)?;
            mounter.set_propagation(&scope, root, Propagation::Shared, true)?;
        }

        self.mount_system(&scope, base, chrooted)?;

        for bind in ctx.binds {
            let target = self.resolver.resolve(base, &bind.target)?;
            let flags = MountFlags {
                readonly: bind.flags.read_only,
                nodev: chrooted,
                ..MountFlags::rw()
            };
            attach_appearance(
                mounter,
                &scope,
                &bind.source,
                &target,
                flags,
                bind.flags.recursive,
            )?;
            tracing::debug!(
                container = %ctx.id,
                source = %bind.source.display(),
                target = %target.display(),
                "Bind mounted"
            );
            attempt.applied.push((scope.clone(), target.clone()));
            attempt.mounts.binds.push(inside(base, &target));
        }

        if let Some(root) = ctx.root {
            mounter.pivot_root(ctx.id, root)?;
            // Only mounts inside the new root survive the pivot.
            attempt.applied = attempt
                .applied
                .drain(..)
                .filter_map(|(s, path)| match s {
                    Scope::Host => Some((s, path)),
                    Scope::Container(_) => {
                        path.starts_with(root).then(|| (s, inside(root, &path)))
                    }
                })
                .collect();
        }

        for link in ctx.links {
            let placement = self.mount_link(ctx.id, ctx.root, link)?;
            attempt
                .applied
                .push((placement.scope.clone(), placement.path.clone()));
            attempt.mounts.links.push(placement);
        }
        Ok(())
    }

    /// Replace inherited `/proc` and `/sys` and mount the standard system
    /// filesystems below `base`. Without a root of its own the container keeps
    /// the host's `/dev` tree.
    fn mount_system(&self, scope: &Scope, base: &Path, chrooted: bool) -> StowResult<()> {
        let mounter = self.mounter.as_ref();
        let at = |rel: &str| base.join(rel);

        let inherited = mounter.snapshot(scope)?;
        for rel in ["sys", "proc"] {
            let path = at(rel);
            if inherited.contains(&path) {
                mounter.unmount(scope, &path, UnmountFlags::detach())?;
            }
        }

        let proc = at("proc");
        mounter.mount_fs(
            scope,
            &Filesystem::new("proc", None),
            &proc,
            MountFlags::pseudo(false),
        )?;
        for entry in PROC_READ_ONLY {
            let path = proc.join(entry);
            mounter.bind(scope, &path, &path, false)?;
            mounter.remount(scope, &path, MountFlags::pseudo(true))?;
        }
        let kcore = proc.join("kcore");
        mounter.bind(scope, Path::new("/dev/null"), &kcore, false)?;
        mounter.remount(scope, &kcore, MountFlags::pseudo(true))?;

        mounter.mount_fs(
            scope,
            &Filesystem::new("sysfs", None),
            &at("sys"),
            MountFlags::pseudo(true),
        )?;

        if chrooted {
            self.mount_dev(scope, &at("dev"))?;
        }

        let private_tmpfs = MountFlags {
            nosuid: true,
            nodev: true,
            ..MountFlags::rw()
        };
        mounter.mount_fs(scope, &Filesystem::tmpfs("mode=755"), &at("run"), private_tmpfs)?;
        Ok(())
    }

    /// A fresh `/dev` with device nodes, its own devpts instance and `/dev/shm`.
    fn mount_dev(&self, scope: &Scope, dev: &Path) -> StowResult<()> {
        let mounter = self.mounter.as_ref();
        mounter.mount_fs(
            scope,
            &Filesystem::tmpfs("mode=755"),
            dev,
            MountFlags {
                nosuid: true,
                ..MountFlags::rw()
            },
        )?;
        mounter.populate_dev(scope, dev)?;
        mounter.mount_fs(
            scope,
            &Filesystem::new("devpts", Some("newinstance,ptmxmode=0666,mode=620")),
            &dev.join("pts"),
            MountFlags {
                nosuid: true,
                noexec: true,
                ..MountFlags::rw()
            },
        )?;

        mounter.mount_fs(
            scope,
            &Filesystem::tmpfs("mode=1777"),
            &dev.join("shm"),
            MountFlags {
                nosuid: true,
                nodev: true,
                ..MountFlags::rw()
            },
        )
    }

    fn rollback(&self, id: &ContainerId, attempt: Attempt) {
        let mounter = self.mounter.as_ref();
        for (scope, path) in attempt.applied.iter().rev() {
            if let Err(e) = mounter.unmount(scope, path, UnmountFlags::detach()) {
                tracing::warn!(
                    %scope,
                    target = %path.display(),
                    error = %e,
                    "Failed to unmount during rollback"
                );
            }
        }
        if let Err(e) = mounter.destroy_namespace(id) {
            tracing::warn!(container = %id, error = %e, "Failed to destroy namespace during rollback");
        }
    }
}

/// `path` as seen from inside `root`.
fn inside(root: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix(root) {
        Ok(rel) => Path::new("/").join(rel),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::MountTable;
    use crate::propagation::PropagationGraph;
    use tempfile::TempDir;

    struct Fixture {
        graph: Arc<PropagationGraph>,
        builder: NamespaceBuilder,
        dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let graph = Arc::new(PropagationGraph::new());
        let paths = StowPaths::with_root(dir.path().join("lib"));
        let staging = paths.staging();
        graph.bind(&Scope::Host, &staging, &staging, false).unwrap();
        graph
            .set_propagation(&Scope::Host, &staging, Propagation::Private, false)
            .unwrap();
        let builder = NamespaceBuilder::new(graph.clone(), paths, BindResolver::default());
        Fixture {
            graph,
            builder,
            dir,
        }
    }

    fn container(name: &str) -> (ContainerId, Scope) {
        let id = ContainerId::new(name).unwrap();
        let scope = Scope::Container(id.clone());
        (id, scope)
    }

    fn check_system_mounts(mnt: &MountTable, chrooted: bool) {
        assert!(mnt.get("/").unwrap().has_flag("rw"));
        assert!(!mnt.get("/").unwrap().has_flag("nosuid"));
        assert_eq!(mnt.get("/").unwrap().has_flag("nodev"), chrooted);
        assert!(!mnt.get("/dev").unwrap().has_flag("nodev"));
        assert!(!mnt.get("/dev/pts").unwrap().has_flag("nodev"));
        assert!(mnt.get("/run").unwrap().has_flag("rw"));
        assert!(mnt.get("/sys").unwrap().is_read_only());
        assert!(mnt.get("/proc").unwrap().has_flag("rw"));
        for ro in ["sysrq-trigger", "irq", "bus", "sys", "kcore"] {
            let entry = mnt.get(Path::new("/proc").join(ro)).unwrap();
            assert!(entry.is_read_only(), "/proc/{ro} should be read-only");
        }
        assert!(!mnt.contains("/sys/fs/cgroup/cpu"));
        assert!(!mnt.contains("/sys/fs/cgroup/memory"));

        // The visible /dev/pts and /dev/shm hang off the visible /dev.
        let dev = mnt.get("/dev").unwrap().mount_id;
        assert_eq!(mnt.get("/dev/pts").unwrap().parent_id, dev);
        assert_eq!(mnt.get("/dev/shm").unwrap().parent_id, dev);
    }

    #[test]
    fn plain_container_gets_system_mounts() {
        let f = fixture();
        let (id, scope) = container("a");
        let ctx = NamespaceContext {
            id: &id,
            root: None,
            binds: &[],
            links: &[],
        };
        f.builder.start(&ctx).unwrap();
        let mnt = f.graph.snapshot(&scope).unwrap();
        check_system_mounts(&mnt, false);
        // Host devices stay: /dev is the host's devtmpfs, not a fresh tmpfs.
        assert_eq!(mnt.get("/dev").unwrap().fstype, "devtmpfs");
        assert_eq!(mnt.iter().filter(|e| e.path == Path::new("/dev")).count(), 1);

        f.builder.stop(&id, &NamespaceMounts::default()).unwrap();
        assert_eq!(f.graph.scopes(), vec![Scope::Host]);
    }

    #[test]
    fn chrooted_container_is_pivoted() {
        let f = fixture();
        let root = f.dir.path().join("rootfs");
        std::fs::create_dir_all(&root).unwrap();
        let (id, scope) = container("a");
        let ctx = NamespaceContext {
            id: &id,
            root: Some(&root),
            binds: &[],
            links: &[],
        };
        f.builder.start(&ctx).unwrap();

        let mnt = f.graph.snapshot(&scope).unwrap();
        check_system_mounts(&mnt, true);
        assert!(mnt.get("/dev/shm").unwrap().has_flag("rw"));
        assert!(mnt.iter().all(|e| !e.path.starts_with(&root)));
    }

    #[test]
    fn binds_follow_the_root_policy() {
        let f = fixture();
        let root = f.dir.path().join("rootfs");
        std::fs::create_dir_all(&root).unwrap();
        let (id, scope) = container("a");
        let binds = [
            BindSpec::new("/run", "/data"),
            "/run /data_ro ro".parse().unwrap(),
        ];
        let ctx = NamespaceContext {
            id: &id,
            root: Some(&root),
            binds: &binds,
            links: &[],
        };
        let mounts = f.builder.start(&ctx).unwrap();
        assert_eq!(
            mounts.binds,
            vec![PathBuf::from("/data"), PathBuf::from("/data_ro")]
        );

        let host_run = f.graph.snapshot(&Scope::Host).unwrap();
        let group = host_run.get("/run").unwrap().shared;
        let mnt = f.graph.snapshot(&scope).unwrap();
        let data = mnt.get("/data").unwrap();
        assert!(data.has_flag("rw") && data.has_flag("nodev") && !data.has_flag("nosuid"));
        assert_eq!(data.master, group);
        assert!(data.shared.is_some());
        assert!(mnt.get("/data_ro").unwrap().is_read_only());
    }

    #[test]
    fn failed_start_destroys_the_namespace() {
        let f = fixture();
        let root = f.dir.path().join("rootfs");
        std::fs::create_dir_all(&root).unwrap();
        std::os::unix::fs::symlink("/loop", root.join("loop")).unwrap();
        let (id, _) = container("a");
        let binds = [BindSpec::new("/run", "/loop/x")];
        let ctx = NamespaceContext {
            id: &id,
            root: Some(&root),
            binds: &binds,
            links: &[],
        };
        let err = f.builder.start(&ctx).unwrap_err();
        assert!(matches!(err, stow_common::StowError::SymlinkResolution { .. }));
        assert_eq!(f.graph.scopes(), vec![Scope::Host]);
    }

    #[test]
    fn chrooted_link_reaches_the_container_from_the_host() {
        let f = fixture();
        let root = f.dir.path().join("rootfs");
        std::fs::create_dir_all(&root).unwrap();
        let (id, scope) = container("a");
        let links = [LinkRequest {
            volume: VolumeId::generate(),
            source: PathBuf::from("/run"),
            target: PathBuf::from("/linked"),
            read_only: true,
        }];
        let ctx = NamespaceContext {
            id: &id,
            root: Some(&root),
            binds: &[],
            links: &links,
        };
        let mounts = f.builder.start(&ctx).unwrap();
        let placement = &mounts.links[0];
        assert_eq!(placement.scope, Scope::Host);
        assert_eq!(placement.path, root.join("linked"));

        let mnt = f.graph.snapshot(&scope).unwrap();
        assert!(mnt.get("/linked").unwrap().is_read_only());

        f.builder.unmount_link(placement).unwrap();
        assert!(!f.graph.snapshot(&scope).unwrap().contains("/linked"));
        assert!(!f.graph.snapshot(&Scope::Host).unwrap().contains(&placement.path));
    }

    #[test]
    fn failed_start_unmounts_host_links() {
        let f = fixture();
        let root = f.dir.path().join("rootfs");
        std::fs::create_dir_all(&root).unwrap();
        std::os::unix::fs::symlink("/loop", root.join("loop")).unwrap();
        let (id, _) = container("a");
        let link = |target: &str| LinkRequest {
            volume: VolumeId::generate(),
            source: PathBuf::from("/run"),
            target: PathBuf::from(target),
            read_only: false,
        };
        let links = [link("/good"), link("/loop/x")];
        let ctx = NamespaceContext {
            id: &id,
            root: Some(&root),
            binds: &[],
            links: &links,
        };
        let err = f.builder.start(&ctx).unwrap_err();
        assert!(matches!(err, stow_common::StowError::SymlinkResolution { .. }));
        assert!(!f.graph.snapshot(&Scope::Host).unwrap().contains(root.join("good")));
        assert_eq!(f.graph.scopes(), vec![Scope::Host]);
    }

    #[test]
    fn stop_skips_mounts_that_are_already_gone() {
        let f = fixture();
        let root = f.dir.path().join("rootfs");
        std::fs::create_dir_all(&root).unwrap();
        let (id, _) = container("a");
        let binds = [BindSpec::new("/run", "/data")];
        let links = [LinkRequest {
            volume: VolumeId::generate(),
            source: PathBuf::from("/run"),
            target: PathBuf::from("/linked"),
            read_only: false,
        }];
        let ctx = NamespaceContext {
            id: &id,
            root: Some(&root),
            binds: &binds,
            links: &links,
        };
        let mounts = f.builder.start(&ctx).unwrap();
        f.graph
            .unmount(&Scope::Host, &root.join("linked"), UnmountFlags::detach())
            .unwrap();

        f.builder.stop(&id, &mounts).unwrap();
        assert_eq!(f.graph.scopes(), vec![Scope::Host]);
        // A second stop finds nothing left and still succeeds.
        f.builder.stop(&id, &mounts).unwrap();
    }
}
