//! End-to-end volume and namespace scenarios on the simulated mount backend.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use stow::bind::parse_binds;
use stow::mount::{MountTable, Scope};
use stow::propagation::PropagationGraph;
use stow::runtime::{ContainerStatus, LinkState, Runtime, RuntimeConfig};
use stow::volume::{Volume, VolumeBackend, VolumeSpec};
use stow_common::{ContainerId, StowError};
use tempfile::TempDir;

/// A runtime on the model with the volumes most scenarios start from.
struct Setup {
    dir: TempDir,
    runtime: Runtime,
    /// Overlay volume used as container root.
    root: Volume,
    /// Plain volume with `sub` mounted below it.
    test: Volume,
    sub: Volume,
    read_only: Volume,
}

fn config(dir: &Path) -> RuntimeConfig {
    RuntimeConfig::default().with_root(dir.join("lib")).simulated()
}

fn setup() -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Runtime::new(config(dir.path())).unwrap();

    let layer = dir.path().join("layer");
    std::fs::create_dir_all(&layer).unwrap();
    let root = runtime
        .create_volume(VolumeSpec::new(VolumeBackend::Overlay).layer(&layer))
        .unwrap();
    let test = runtime
        .create_volume(VolumeSpec::new(VolumeBackend::Plain))
        .unwrap();
    let sub = runtime
        .create_volume(VolumeSpec::new(VolumeBackend::Plain).path(test.path.join("sub")))
        .unwrap();
    let read_only = runtime
        .create_volume(VolumeSpec::new(VolumeBackend::Plain).read_only())
        .unwrap();

    Setup {
        dir,
        runtime,
        root,
        test,
        sub,
        read_only,
    }
}

fn id(name: &str) -> ContainerId {
    ContainerId::new(name).unwrap()
}

fn host(runtime: &Runtime) -> MountTable {
    runtime.mounts(&Scope::Host).unwrap()
}

fn inside(runtime: &Runtime, id: &ContainerId) -> MountTable {
    runtime.mounts(&Scope::Container(id.clone())).unwrap()
}

fn check_system_mounts(mnt: &MountTable, chrooted: bool) {
    let root = mnt.get("/").unwrap();
    assert!(root.has_flag("rw"));
    assert!(!root.has_flag("nosuid"));
    assert_eq!(root.has_flag("nodev"), chrooted);
    assert!(!mnt.get("/dev").unwrap().has_flag("nodev"));
    assert!(!mnt.get("/dev/pts").unwrap().has_flag("nodev"));
    assert!(mnt.get("/dev/shm").unwrap().has_flag("rw"));
    // The visible /dev/pts and /dev/shm hang off the visible /dev.
    let dev = mnt.get("/dev").unwrap().mount_id;
    assert_eq!(mnt.get("/dev/pts").unwrap().parent_id, dev);
    assert_eq!(mnt.get("/dev/shm").unwrap().parent_id, dev);
    assert!(mnt.get("/run").unwrap().has_flag("rw"));
    assert!(mnt.get("/sys").unwrap().is_read_only());
    assert!(mnt.get("/proc").unwrap().has_flag("rw"));
    assert!(mnt.get("/proc/sysrq-trigger").unwrap().is_read_only());
    assert!(mnt.get("/proc/kcore").unwrap().is_read_only());
    assert!(!mnt.contains("/sys/fs/cgroup/cpu"));
    assert!(!mnt.contains("/sys/fs/cgroup/memory"));
}

#[test_log::test]
fn host_volumes_strip_devices_and_suid() {
    let s = setup();
    let mnt = host(&s.runtime);

    let root = mnt.get(&s.root.path).unwrap();
    assert!(root.has_flag("rw") && root.has_flag("nodev") && root.has_flag("nosuid"));
    assert!(root.shared.is_some());
    assert!(mnt.get(&s.read_only.path).unwrap().is_read_only());
    assert!(mnt.get(&s.sub.path).unwrap().has_flag("rw"));
}

#[test_log::test]
fn system_mounts_with_and_without_chroot() {
    let s = setup();

    let plain = s.runtime.run("plain", None, Vec::new()).unwrap();
    let mnt = inside(&s.runtime, &plain);
    check_system_mounts(&mnt, false);
    assert_eq!(mnt.get("/dev").unwrap().fstype, "devtmpfs");

    let chrooted = s
        .runtime
        .run("chrooted", Some(s.root.path.clone()), Vec::new())
        .unwrap();
    let mnt = inside(&s.runtime, &chrooted);
    check_system_mounts(&mnt, true);
    assert!(mnt.iter().all(|e| !e.path.starts_with(&s.root.path)));

    s.runtime.destroy(&plain).unwrap();
    s.runtime.destroy(&chrooted).unwrap();
    assert_eq!(s.runtime.volumes().len(), 4);
    assert!(s.runtime.containers().is_empty());
}

#[test_log::test]
fn bind_specs_and_later_sub_volumes() {
    let s = setup();
    let binds = parse_binds(&format!(
        "{test} /test; {test} /test_ro ro,rec; {ro} /ro_vol",
        test = s.test.path.display(),
        ro = s.read_only.path.display(),
    ))
    .unwrap();
    let a = s
        .runtime
        .run("a", Some(s.root.path.clone()), binds)
        .unwrap();

    let on_host = host(&s.runtime);
    let test_group = on_host.get(&s.test.path).unwrap().shared;
    let sub_group = on_host.get(&s.sub.path).unwrap().shared;

    let mnt = inside(&s.runtime, &a);
    let test = mnt.get("/test").unwrap();
    assert!(test.has_flag("rw") && test.has_flag("nodev") && !test.has_flag("nosuid"));
    assert!(test.shared.is_some());
    assert_eq!(test.master, test_group);
    assert!(!mnt.contains("/test/sub"));

    let test_ro = mnt.get("/test_ro").unwrap();
    assert!(test_ro.is_read_only());
    assert_eq!(test_ro.master, test_group);
    let test_ro_sub = mnt.get("/test_ro/sub").unwrap();
    assert!(test_ro_sub.is_read_only());
    assert!(test_ro_sub.shared.is_some());
    assert_eq!(test_ro_sub.master, sub_group);

    // Read-only volumes stay read-only behind a read-write bind.
    assert!(mnt.get("/ro_vol").unwrap().is_read_only());

    let sub2 = s
        .runtime
        .create_volume(
            VolumeSpec::new(VolumeBackend::Plain)
                .path(s.test.path.join("sub2"))
                .owner(a.clone()),
        )
        .unwrap();
    let mnt = inside(&s.runtime, &a);
    assert!(mnt.get("/test/sub2").unwrap().has_flag("rw"));
    assert!(mnt.get("/test_ro/sub2").unwrap().has_flag("rw"));

    s.runtime.destroy(&a).unwrap();
    assert!(matches!(
        s.runtime.volume(&sub2.id),
        Err(StowError::VolumeNotFound { .. })
    ));
    assert!(!host(&s.runtime).contains(&sub2.path));
}

#[test_log::test]
fn shallow_read_only_bind_sees_new_volumes_read_write() {
    let s = setup();
    let binds = parse_binds(&format!("{} /m ro", s.test.path.display())).unwrap();
    let a = s
        .runtime
        .run("a", Some(s.root.path.clone()), binds)
        .unwrap();
    let mnt = inside(&s.runtime, &a);
    assert!(mnt.get("/m").unwrap().is_read_only());
    assert!(!mnt.contains("/m/sub"));

    s.runtime
        .create_volume(
            VolumeSpec::new(VolumeBackend::Plain)
                .path(s.test.path.join("new"))
                .owner(a.clone()),
        )
        .unwrap();
    let mnt = inside(&s.runtime, &a);
    assert!(mnt.get("/m").unwrap().is_read_only());
    let new = mnt.get("/m/new").unwrap();
    assert!(new.has_flag("rw") && !new.is_read_only());
    assert!(!mnt.contains("/m/sub"));

    s.runtime.destroy(&a).unwrap();
    assert!(!host(&s.runtime).contains(s.test.path.join("new")));
}

#[test_log::test]
fn symlinked_bind_target_lands_on_the_link_destination() {
    let s = setup();
    std::fs::create_dir_all(s.root.path.join("symlink_dst")).unwrap();
    std::os::unix::fs::symlink("/symlink_dst", s.root.path.join("symlink_src")).unwrap();

    let binds = parse_binds(&format!("{} /symlink_src", s.test.path.display())).unwrap();
    let a = s
        .runtime
        .run("a", Some(s.root.path.clone()), binds)
        .unwrap();

    let group = host(&s.runtime).get(&s.test.path).unwrap().shared;
    let mnt = inside(&s.runtime, &a);
    assert!(!mnt.contains("/symlink_src"));
    assert_eq!(mnt.get("/symlink_dst").unwrap().master, group);
    s.runtime.destroy(&a).unwrap();
}

#[test_log::test]
fn links_do_not_propagate_backwards() {
    let s = setup();
    let a = s
        .runtime
        .run("a", Some(s.root.path.clone()), Vec::new())
        .unwrap();
    let r = &s.root.path;

    let volume = |backend, path: PathBuf, read_only| {
        let mut spec = VolumeSpec::new(backend)
            .storage(&s.test.path)
            .path(path)
            .owner(a.clone());
        spec.read_only = read_only;
        s.runtime.create_volume(spec).unwrap()
    };
    volume(VolumeBackend::Bind, r.join("test"), false);
    volume(VolumeBackend::Rbind, r.join("test_rbind"), false);
    volume(VolumeBackend::Rbind, r.join("test_ro_rbind"), true);

    let on_host = host(&s.runtime);
    assert!(on_host.contains(r.join("test_rbind/sub")));
    let mnt = inside(&s.runtime, &a);
    let test = mnt.get("/test").unwrap();
    assert!(test.has_flag("rw") && test.has_flag("nodev") && test.has_flag("nosuid"));
    assert!(!mnt.contains("/test/sub"));
    assert!(mnt.get("/test_rbind/sub").unwrap().has_flag("rw"));
    assert!(mnt.get("/test_ro_rbind").unwrap().is_read_only());
    assert!(mnt.get("/test_ro_rbind/sub").unwrap().is_read_only());

    let sub2 = s
        .runtime
        .create_volume(
            VolumeSpec::new(VolumeBackend::Plain)
                .path(s.test.path.join("sub2"))
                .owner(a.clone()),
        )
        .unwrap();
    let mnt = inside(&s.runtime, &a);
    assert!(mnt.get("/test/sub2").unwrap().has_flag("rw"));
    assert!(mnt.get("/test_rbind/sub2").unwrap().has_flag("rw"));
    // Read-only does not carry over to mounts created later.
    assert!(mnt.get("/test_ro_rbind/sub2").unwrap().has_flag("rw"));

    // A sibling binding the storage directory itself, started before the link.
    let b_root = s.dir.path().join("rootfs_b");
    std::fs::create_dir_all(&b_root).unwrap();
    let binds = parse_binds(&format!("{} /test_rbind rec", s.test.path.display())).unwrap();
    let b = s.runtime.run("b", Some(b_root), binds).unwrap();
    assert!(inside(&s.runtime, &b).contains("/test_rbind/sub2"));

    s.runtime
        .link(&sub2.id, &a, "/test_rbind/sub2_link", false)
        .unwrap();
    let on_host = host(&s.runtime);
    assert!(on_host.contains(r.join("test_rbind/sub2_link")));
    assert!(!on_host.contains(r.join("test_ro_rbind/sub2_link")));
    assert!(!on_host.contains(s.test.path.join("sub2_link")));
    assert!(inside(&s.runtime, &a).contains("/test_rbind/sub2_link"));
    assert!(!inside(&s.runtime, &b).contains("/test_rbind/sub2_link"));

    s.runtime.destroy(&b).unwrap();
    s.runtime.destroy(&a).unwrap();
    let on_host = host(&s.runtime);
    assert!(on_host.under(r).all(|e| &e.path == r));
    assert!(!on_host.contains(&sub2.path));
    assert_eq!(s.runtime.volumes().len(), 4);
}

#[test_log::test]
fn volumes_created_from_a_chroot() {
    let s = setup();
    let a = s
        .runtime
        .run("a", Some(s.root.path.clone()), Vec::new())
        .unwrap();

    let rw = s
        .runtime
        .create_volume(
            VolumeSpec::new(VolumeBackend::Plain)
                .path("/test")
                .owner(a.clone())
                .origin(a.clone()),
        )
        .unwrap();
    let ro = s
        .runtime
        .create_volume(
            VolumeSpec::new(VolumeBackend::Plain)
                .path("/test_ro")
                .read_only()
                .owner(a.clone())
                .origin(a.clone()),
        )
        .unwrap();
    assert_eq!(rw.path, s.root.path.join("test"));
    assert_eq!(ro.path, s.root.path.join("test_ro"));

    let on_host = host(&s.runtime);
    assert!(on_host.get(&rw.path).unwrap().has_flag("rw"));
    assert!(on_host.get(&ro.path).unwrap().is_read_only());
    let mnt = inside(&s.runtime, &a);
    assert!(mnt.get("/test").unwrap().has_flag("rw"));
    assert!(mnt.get("/test_ro").unwrap().is_read_only());

    s.runtime.destroy(&a).unwrap();
    assert_eq!(s.runtime.volumes().len(), 4);
}

#[test_log::test]
fn links_follow_the_container_lifecycle() {
    let s = setup();
    let rt = &s.runtime;
    let r = &s.root.path;
    let a = rt.create_container("a").unwrap();
    rt.set_root(&a, Some(r.clone())).unwrap();

    rt.link(&s.test.id, &a, "/test_ro", true).unwrap();
    rt.link(&s.read_only.id, &a, "/ro_vol", true).unwrap();
    rt.link(&s.test.id, &a, "/test", false).unwrap();
    rt.link(&s.test.id, &a, "/test/test", false).unwrap();
    assert!(
        rt.links(&a)
            .unwrap()
            .iter()
            .all(|l| l.state == LinkState::Created)
    );
    assert!(!host(rt).contains(r.join("test_ro")));

    rt.start(&a).unwrap();
    let on_host = host(rt);
    let test_ro = on_host.get(r.join("test_ro")).unwrap();
    assert!(test_ro.is_read_only() && test_ro.has_flag("nodev") && test_ro.has_flag("nosuid"));
    assert!(!on_host.contains(r.join("test_ro/sub")));
    assert!(on_host.get(r.join("ro_vol")).unwrap().is_read_only());
    assert!(on_host.get(r.join("test")).unwrap().has_flag("rw"));
    assert!(on_host.contains(r.join("test/test")));

    let mnt = inside(rt, &a);
    assert!(mnt.get("/test_ro").unwrap().is_read_only());
    assert!(!mnt.contains("/test_ro/sub"));
    assert!(mnt.get("/ro_vol").unwrap().is_read_only());
    assert!(mnt.get("/test").unwrap().has_flag("rw"));
    assert!(mnt.contains("/test/test"));
    assert!(
        rt.links(&a)
            .unwrap()
            .iter()
            .all(|l| l.state == LinkState::Mounted)
    );

    rt.stop(&a).unwrap();
    let on_host = host(rt);
    for target in ["test_ro", "ro_vol", "test", "test/test"] {
        assert!(!on_host.contains(r.join(target)), "{target} left on the host");
    }

    rt.start(&a).unwrap();
    assert!(host(rt).contains(r.join("test/test")));
    assert!(inside(rt, &a).contains("/test/test"));

    rt.unlink(&s.test.id, &a).unwrap();
    let on_host = host(rt);
    assert!(!on_host.contains(r.join("test_ro")));
    assert!(!on_host.contains(r.join("test")));
    let mnt = inside(rt, &a);
    assert!(!mnt.contains("/test_ro"));
    assert!(!mnt.contains("/test"));
    assert!(!mnt.contains("/test/test"));
    assert!(mnt.contains("/ro_vol"));

    rt.unlink(&s.read_only.id, &a).unwrap();
    assert!(!inside(rt, &a).contains("/ro_vol"));
    assert!(matches!(
        rt.unlink(&s.read_only.id, &a),
        Err(StowError::LinkNotFound { .. })
    ));
    rt.destroy(&a).unwrap();
}

#[test_log::test]
fn unlinking_releases_links_nested_below() {
    let s = setup();
    let rt = &s.runtime;
    let r = &s.root.path;
    let a = rt.create_container("a").unwrap();
    rt.set_root(&a, Some(r.clone())).unwrap();
    rt.link(&s.test.id, &a, "/data", false).unwrap();
    rt.link(&s.read_only.id, &a, "/data/inner", true).unwrap();
    rt.start(&a).unwrap();
    assert!(host(rt).contains(r.join("data/inner")));
    assert!(inside(rt, &a).contains("/data/inner"));

    rt.unlink(&s.test.id, &a).unwrap();
    let links = rt.links(&a).unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].volume, s.read_only.id);
    assert_eq!(links[0].state, LinkState::Created);
    let on_host = host(rt);
    assert!(!on_host.contains(r.join("data")));
    assert!(!on_host.contains(r.join("data/inner")));
    assert!(!inside(rt, &a).contains("/data/inner"));
    assert!(rt.container(&a).unwrap().mounts().links.is_empty());

    rt.stop(&a).unwrap();
    rt.destroy(&a).unwrap();
    assert!(rt.containers().is_empty());
}

#[test_log::test]
fn plain_container_links_mount_in_place() {
    let s = setup();
    let rt = &s.runtime;
    let a = rt.run("a", None, Vec::new()).unwrap();
    let target = s.dir.path().join("linked");

    let link = rt.link(&s.test.id, &a, &target, true).unwrap();
    assert_eq!(link.state, LinkState::Mounted);
    assert!(inside(rt, &a).get(&target).unwrap().is_read_only());
    assert!(!host(rt).contains(&target));

    // Destroying the volume unlinks it first.
    rt.destroy_volume(&s.test.id).unwrap();
    assert!(!inside(rt, &a).contains(&target));
    assert!(rt.links(&a).unwrap().is_empty());
    assert!(rt.container(&a).unwrap().mounts().links.is_empty());

    // A destroyed volume cannot be linked again.
    assert!(matches!(
        rt.link(&s.test.id, &a, &target, false),
        Err(StowError::VolumeNotFound { .. })
    ));
    assert!(rt.links(&a).unwrap().is_empty());
    rt.destroy(&a).unwrap();
}

#[test_log::test]
fn link_racing_volume_destroy_leaves_nothing_behind() {
    let s = setup();
    let rt = &s.runtime;
    let a = rt.run("a", None, Vec::new()).unwrap();

    for round in 0..16 {
        let volume = rt
            .create_volume(VolumeSpec::new(VolumeBackend::Plain))
            .unwrap();
        let target = s.dir.path().join(format!("race{round}"));
        let (linked, destroyed) = std::thread::scope(|scope| {
            let link = scope.spawn(|| rt.link(&volume.id, &a, &target, false));
            let destroy = scope.spawn(|| rt.destroy_volume(&volume.id));
            (link.join().unwrap(), destroy.join().unwrap())
        });

        destroyed.unwrap();
        if let Err(e) = linked {
            assert!(matches!(e, StowError::VolumeNotFound { .. }), "{e}");
        }
        assert!(rt.links(&a).unwrap().is_empty());
        assert!(rt.container(&a).unwrap().mounts().links.is_empty());
        assert!(!inside(rt, &a).contains(&target));
        assert!(!host(rt).contains(&volume.path));
    }
    rt.destroy(&a).unwrap();
}

#[test_log::test]
fn shared_volumes_outlive_one_owner() {
    let s = setup();
    let rt = &s.runtime;
    let a = rt.create_container("a").unwrap();
    let b = rt.create_container("b").unwrap();
    let shared = rt
        .create_volume(
            VolumeSpec::new(VolumeBackend::Plain)
                .owner(a.clone())
                .owner(b.clone()),
        )
        .unwrap();

    rt.destroy(&a).unwrap();
    assert_eq!(
        rt.volume(&shared.id).unwrap().owners.into_iter().collect::<Vec<_>>(),
        vec![b.clone()]
    );
    rt.destroy(&b).unwrap();
    assert!(rt.volume(&shared.id).is_err());
    assert!(!host(rt).contains(&shared.path));
}

#[test_log::test]
fn configuration_is_refused_while_running() {
    let s = setup();
    let rt = &s.runtime;
    let a = rt.run("a", None, Vec::new()).unwrap();

    assert!(matches!(
        rt.set_root(&a, Some(s.root.path.clone())),
        Err(StowError::InvalidState { .. })
    ));
    assert!(matches!(rt.start(&a), Err(StowError::InvalidState { .. })));
    assert!(matches!(
        rt.create_container("a"),
        Err(StowError::Config { .. })
    ));
    assert!(rt.set_root(&a, Some(PathBuf::from("relative"))).is_err());

    rt.stop(&a).unwrap();
    assert_eq!(rt.status(&a).unwrap(), ContainerStatus::Stopped);
    assert!(matches!(rt.stop(&a), Err(StowError::InvalidState { .. })));
    rt.destroy(&a).unwrap();
    assert!(matches!(
        rt.status(&a),
        Err(StowError::ContainerNotFound { .. })
    ));
}

#[test_log::test]
fn state_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let graph = Arc::new(PropagationGraph::new());
    let open = || Runtime::with_mounter(config(dir.path()), graph.clone()).unwrap();

    let (volume, a) = {
        let rt = open();
        let volume = rt
            .create_volume(VolumeSpec::new(VolumeBackend::Plain))
            .unwrap();
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir_all(&rootfs).unwrap();
        let binds = parse_binds(&format!("{} /data ro", volume.path.display())).unwrap();
        let a = rt.run("a", Some(rootfs), binds).unwrap();
        rt.link(&volume.id, &a, "/linked", false).unwrap();
        assert!(host(&rt).contains(dir.path().join("rootfs/linked")));
        (volume, a)
    };

    // The process that built the namespace is gone; the record says running.
    let rt = open();
    assert_eq!(rt.volume(&volume.id).unwrap().path, volume.path);
    assert_eq!(rt.status(&a).unwrap(), ContainerStatus::Stopped);
    assert_eq!(graph.scopes(), vec![Scope::Host]);
    assert!(!host(&rt).contains(dir.path().join("rootfs/linked")));

    let links = rt.links(&a).unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].state, LinkState::Created);
    assert_eq!(rt.container(&a).unwrap().binds().len(), 1);

    rt.start(&a).unwrap();
    let mnt = inside(&rt, &a);
    assert!(mnt.get("/data").unwrap().is_read_only());
    assert!(mnt.contains("/linked"));
    rt.destroy(&a).unwrap();
    rt.destroy_volume(&volume.id).unwrap();
    assert!(rt.volumes().is_empty());
}
