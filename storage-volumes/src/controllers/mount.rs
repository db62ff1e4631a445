// SPDX-License-Identifier: GPL-3.0-only

//! Executes `MountRequest`s and reports them as `MountStatus`es.
//!
//! Finalizers keep the pieces in order: the controller holds the request,
//! the volume status and, for nested mounts, the parent mount status while
//! a mount is active. Unmounting starts by tearing the mount status down so
//! that everyone consuming it lets go first.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, anyhow};
use storage_contracts::{MountPoint, TargetSettings, VolumeResult};
use storage_runtime::{Controller, ControllerContext, Input, Output};
use storage_types::constants::OVERLAY_ROOT;
use storage_types::{
    FilesystemType, MountRequestSpec, MountStatusSpec, Resource, VolumePhase, VolumeStatusSpec,
    VolumeType,
};
use tracing::{debug, info, warn};

use crate::backends::Backends;

/// What has to be undone for an active request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Undo {
    Unmount,
    SwapOff(String),
    /// Directories and symlinks stay behind.
    Nothing,
}

#[derive(Debug, Clone)]
struct Active {
    target: String,
    read_only: bool,
    undo: Undo,
}

pub struct MountController {
    backends: Backends,
    /// Requests mounted by this controller, by request id.
    active: HashMap<String, Active>,
}

fn parent_finalizer(request: &str) -> String {
    format!("{}-{}", MountController::NAME, request)
}

/// Absolute targets stand alone; relative ones live under the parent mount.
fn resolve_target(parent_target: Option<&str>, target: &str) -> String {
    match parent_target {
        Some(parent) if !target.starts_with('/') => Path::new(parent).join(target).display().to_string(),
        _ => target.to_string(),
    }
}

/// `/usr/etc` keeps its overlay layers under `usr-etc-diff` and `usr-etc-workdir`.
fn overlay_name(target: &str) -> String {
    target.trim_matches('/').replace('/', "-")
}

fn target_settings(status: &VolumeStatusSpec) -> TargetSettings {
    TargetSettings {
        file_mode: status.mount_spec.file_mode,
        uid: status.mount_spec.uid,
        gid: status.mount_spec.gid,
        selinux_label: status.mount_spec.selinux_label.clone(),
        recursive: status.mount_spec.recursive_relabel,
    }
}

impl MountController {
    pub const NAME: &'static str = "MountController";

    pub fn new(backends: Backends) -> Self {
        Self {
            backends,
            active: HashMap::new(),
        }
    }

    pub fn reconcile(&mut self, ctx: &ControllerContext) -> anyhow::Result<()> {
        let mut failed = Vec::new();

        for request in ctx.list::<MountRequestSpec>() {
            let id = request.id().to_string();
            let status = ctx.get::<VolumeStatusSpec>(&request.spec.volume_id);
            let mount_status = ctx.get::<MountStatusSpec>(&id);

            let usable = status.as_ref().filter(|status| {
                status.metadata.is_running() && status.spec.phase == VolumePhase::Ready
            });
            let tear = request.metadata.is_tearing_down()
                || usable.is_none()
                || mount_status.as_ref().is_some_and(|m| m.metadata.is_tearing_down());

            let result = match (tear, usable) {
                (false, Some(status)) => self.mount(ctx, &request, status),
                _ => self.unmount(ctx, &id, &request.spec, mount_status.as_ref()),
            };

            if let Err(err) = result {
                warn!("mount request {}: {:#}", id, err);
                failed.push(id);
            }
        }

        // statuses whose request vanished
        for mount_status in ctx.list::<MountStatusSpec>() {
            let id = mount_status.id().to_string();
            if ctx.get::<MountRequestSpec>(&id).is_some() {
                continue;
            }
            if let Err(err) = self.unmount(ctx, &id, &mount_status.spec.spec, Some(&mount_status)) {
                warn!("mount status {}: {:#}", id, err);
                failed.push(id);
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("failed to reconcile mounts: {}", failed.join(", ")))
        }
    }

    fn mount(
        &mut self,
        ctx: &ControllerContext,
        request: &Resource<MountRequestSpec>,
        status: &Resource<VolumeStatusSpec>,
    ) -> anyhow::Result<()> {
        let id = request.id();
        let spec = &request.spec;

        let parent_target = if spec.parent_mount_id.is_empty() {
            None
        } else {
            match ctx.get::<MountStatusSpec>(&spec.parent_mount_id) {
                Some(parent) if parent.metadata.is_running() => {
                    ctx.add_finalizer::<MountStatusSpec>(&spec.parent_mount_id, &parent_finalizer(id))
                        .with_context(|| format!("failed to hold parent mount {}", spec.parent_mount_id))?;
                    Some(parent.spec.target)
                }
                _ => {
                    debug!("mount {} waits for parent {}", id, spec.parent_mount_id);
                    return Ok(());
                }
            }
        };

        ctx.add_finalizer::<MountRequestSpec>(id, Self::NAME)
            .with_context(|| format!("failed to hold mount request {}", id))?;
        ctx.add_finalizer::<VolumeStatusSpec>(status.id(), Self::NAME)
            .with_context(|| format!("failed to hold volume status {}", status.id()))?;

        let target = resolve_target(parent_target.as_deref(), &status.spec.mount_spec.target_path);

        match self.active.get(id).cloned() {
            Some(active) if active.read_only != spec.read_only && active.undo == Undo::Unmount => {
                self.backends
                    .mounts
                    .remount(&active.target, spec.read_only)
                    .with_context(|| format!("failed to remount {}", active.target))?;
                info!("remounted {} read_only={}", active.target, spec.read_only);
                if let Some(entry) = self.active.get_mut(id) {
                    entry.read_only = spec.read_only;
                }
            }
            Some(_) => {}
            None => {
                let undo = self
                    .perform_mount(&status.spec, &target, spec.read_only, parent_target.as_deref())
                    .with_context(|| format!("failed to mount {} at {}", status.id(), target))?;
                if undo != Undo::Nothing {
                    info!("mounted {} at {}", status.id(), target);
                }
                self.active.insert(
                    id.to_string(),
                    Active {
                        target: target.clone(),
                        read_only: spec.read_only,
                        undo,
                    },
                );
            }
        }

        let mount_status = MountStatusSpec {
            spec: spec.clone(),
            source: status.spec.mount_location.clone(),
            target,
            filesystem: status.spec.filesystem.as_str().to_string(),
            read_only: spec.read_only,
            encryption_provider: status.spec.encryption_provider.clone(),
            project_quota_support: status.spec.mount_spec.project_quota_support,
        };
        ctx.modify(id, MountStatusSpec::default, |m| m.spec = mount_status)
            .with_context(|| format!("failed to write mount status {}", id))?;

        Ok(())
    }

    fn perform_mount(
        &self,
        status: &VolumeStatusSpec,
        target: &str,
        read_only: bool,
        parent_target: Option<&str>,
    ) -> VolumeResult<Undo> {
        let mounts = &self.backends.mounts;

        match status.volume_type {
            VolumeType::Directory => {
                mounts.ensure_directory(target)?;
                mounts.apply_settings(target, &target_settings(status))?;
                Ok(Undo::Nothing)
            }
            VolumeType::Symlink => {
                mounts.ensure_symlink(
                    &status.symlink_spec.symlink_target_path,
                    target,
                    status.symlink_spec.force,
                )?;
                Ok(Undo::Nothing)
            }
            VolumeType::Overlay => {
                let base = format!(
                    "{}/{}",
                    parent_target.unwrap_or_default().trim_end_matches('/'),
                    OVERLAY_ROOT.trim_start_matches('/')
                );
                let name = overlay_name(target);
                let upper = format!("{}/{}-diff", base, name);
                let work = format!("{}/{}-workdir", base, name);

                mounts.ensure_directory(&upper)?;
                mounts.ensure_directory(&work)?;
                mounts.ensure_directory(target)?;
                mounts.mount(&MountPoint {
                    source: "overlay".to_string(),
                    target: target.to_string(),
                    filesystem: "overlay".to_string(),
                    read_only,
                    data: format!("lowerdir={},upperdir={},workdir={}", target, upper, work),
                    ..Default::default()
                })?;
                Ok(Undo::Unmount)
            }
            VolumeType::Tmpfs => {
                mounts.ensure_directory(target)?;
                mounts.mount(&MountPoint {
                    source: "tmpfs".to_string(),
                    target: target.to_string(),
                    filesystem: "tmpfs".to_string(),
                    read_only,
                    data: format!("mode={:o}", status.mount_spec.file_mode),
                    ..Default::default()
                })?;
                Ok(Undo::Unmount)
            }
            VolumeType::Partition | VolumeType::Disk | VolumeType::External
                if status.filesystem == FilesystemType::Swap =>
            {
                mounts.swap_on(&status.mount_location)?;
                Ok(Undo::SwapOff(status.mount_location.clone()))
            }
            VolumeType::Partition | VolumeType::Disk | VolumeType::External => {
                let mut data = Vec::new();
                if status.mount_spec.project_quota_support {
                    data.push("prjquota");
                }

                mounts.ensure_directory(target)?;
                mounts.mount(&MountPoint {
                    source: status.mount_location.clone(),
                    target: target.to_string(),
                    filesystem: status.filesystem.as_str().to_string(),
                    read_only,
                    noatime: true,
                    bind: status.mount_spec.bind_target,
                    data: data.join(","),
                })?;

                if !read_only {
                    mounts.apply_settings(target, &target_settings(status))?;
                }
                Ok(Undo::Unmount)
            }
        }
    }

    fn unmount(
        &mut self,
        ctx: &ControllerContext,
        id: &str,
        spec: &MountRequestSpec,
        mount_status: Option<&Resource<MountStatusSpec>>,
    ) -> anyhow::Result<()> {
        if let Some(mount_status) = mount_status {
            let released = ctx
                .teardown::<MountStatusSpec>(mount_status.id())
                .with_context(|| format!("failed to tear down mount status {}", id))?;
            if !released {
                debug!("mount {} is still in use", id);
                return Ok(());
            }
        }

        let undo = match self.active.get(id) {
            Some(active) => Some((active.target.clone(), active.undo.clone())),
            // mounted before a restart
            None => mount_status.map(|m| (m.spec.target.clone(), Undo::Unmount)),
        };

        if let Some((target, undo)) = undo {
            match undo {
                Undo::Unmount => {
                    self.backends
                        .mounts
                        .unmount(&target)
                        .with_context(|| format!("failed to unmount {}", target))?;
                    info!("unmounted {}", target);
                }
                Undo::SwapOff(device) => {
                    self.backends
                        .mounts
                        .swap_off(&device)
                        .with_context(|| format!("failed to disable swap on {}", device))?;
                    info!("swap disabled on {}", device);
                }
                Undo::Nothing => {}
            }
        }
        self.active.remove(id);

        if mount_status.is_some() {
            match ctx.destroy::<MountStatusSpec>(id) {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err).with_context(|| format!("failed to destroy mount status {}", id)),
            }
        }

        if !spec.parent_mount_id.is_empty() {
            release(ctx.remove_finalizer::<MountStatusSpec>(&spec.parent_mount_id, &parent_finalizer(id)))?;
        }
        release(ctx.remove_finalizer::<VolumeStatusSpec>(&spec.volume_id, Self::NAME))?;
        release(ctx.remove_finalizer::<MountRequestSpec>(id, Self::NAME))?;

        Ok(())
    }
}

fn release(result: storage_runtime::Result<()>) -> anyhow::Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.is_not_found() => Ok(()),
        Err(err) => Err(err.into()),
    }
}

impl Controller for MountController {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::of::<MountRequestSpec>(),
            Input::of::<VolumeStatusSpec>(),
            Input::of::<MountStatusSpec>(),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<MountStatusSpec>()]
    }

    fn run(&mut self, ctx: &mut ControllerContext) -> anyhow::Result<()> {
        while ctx.next_event() {
            self.reconcile(ctx)?;
            ctx.reset_restart_backoff();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use storage_runtime::Store;
    use storage_testing::{FakeHost, TestContext};
    use storage_types::{MountSpec, SymlinkProvisioningSpec};

    use crate::controllers::testing;

    struct Harness {
        store: Arc<Store>,
        host: Arc<FakeHost>,
        test: TestContext,
        controller: MountController,
    }

    impl Harness {
        fn new() -> Self {
            let store = Store::new();
            let host = Arc::new(FakeHost::new());
            let test = TestContext::new(&store, MountController::NAME);
            let controller = MountController::new(testing::backends(&host));
            Self {
                store,
                host,
                test,
                controller,
            }
        }

        fn volume(&self, id: &str, status: VolumeStatusSpec) {
            self.store
                .modify("VolumeManagerController", id, VolumeStatusSpec::default, |s| s.spec = status)
                .unwrap();
        }

        fn request(&self, id: &str, read_only: bool, parent: &str) {
            self.store
                .modify("MountRequestController", id, MountRequestSpec::default, |r| {
                    r.spec = MountRequestSpec {
                        volume_id: id.to_string(),
                        requesters: vec!["VolumeConfigController".to_string()],
                        requester_ids: vec![id.to_string()],
                        read_only,
                        parent_mount_id: parent.to_string(),
                    }
                })
                .unwrap();
        }

        fn reconcile(&mut self) {
            self.controller.reconcile(&self.test.ctx).unwrap();
        }
    }

    fn partition(target: &str) -> VolumeStatusSpec {
        VolumeStatusSpec {
            phase: VolumePhase::Ready,
            volume_type: VolumeType::Partition,
            location: "/dev/sda3".to_string(),
            mount_location: "/dev/sda3".to_string(),
            filesystem: FilesystemType::Xfs,
            mount_spec: MountSpec {
                target_path: target.to_string(),
                file_mode: 0o755,
                project_quota_support: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn partition_is_mounted_and_reported() {
        let mut h = Harness::new();
        h.volume("EPHEMERAL", partition("/var"));
        h.request("EPHEMERAL", false, "");

        h.reconcile();

        let point = h.host.mount_at("/var").unwrap();
        assert_eq!(point.source, "/dev/sda3");
        assert_eq!(point.filesystem, "xfs");
        assert!(point.noatime);
        assert_eq!(point.data, "prjquota");
        assert_eq!(h.host.settings("/var").unwrap().file_mode, 0o755);

        let status = h.store.get::<MountStatusSpec>("EPHEMERAL").unwrap().spec;
        assert_eq!(status.target, "/var");
        assert_eq!(status.filesystem, "xfs");
        assert!(status.project_quota_support);

        let volume = h.store.get::<VolumeStatusSpec>("EPHEMERAL").unwrap();
        assert!(volume.metadata.has_finalizer(MountController::NAME));

        // a second pass does not mount again
        h.reconcile();
        assert_eq!(h.host.log().iter().filter(|l| l.starts_with("mount")).count(), 1);
    }

    #[test]
    fn read_only_change_remounts_in_place() {
        let mut h = Harness::new();
        h.volume("u-data", partition("/var/mnt/data"));
        h.request("u-data", false, "");
        h.reconcile();

        h.request("u-data", true, "");
        h.reconcile();

        assert!(h.host.mount_at("/var/mnt/data").unwrap().read_only);
        assert!(h.host.log().contains(&"remount /var/mnt/data ro=true".to_string()));
        assert!(h.store.get::<MountStatusSpec>("u-data").unwrap().spec.read_only);
    }

    #[test]
    fn teardown_waits_for_status_consumers() {
        let mut h = Harness::new();
        h.volume("u-data", partition("/var/mnt/data"));
        h.request("u-data", false, "");
        h.reconcile();
        h.store
            .add_finalizer::<MountStatusSpec>("u-data", "MountStatusController")
            .unwrap();

        h.store
            .teardown::<MountRequestSpec>("MountRequestController", "u-data")
            .unwrap();
        h.reconcile();
        assert!(h.host.mount_at("/var/mnt/data").is_some());
        assert!(h.store.get::<MountStatusSpec>("u-data").unwrap().metadata.is_tearing_down());

        h.store
            .remove_finalizer::<MountStatusSpec>("u-data", "MountStatusController")
            .unwrap();
        h.reconcile();

        assert!(h.host.mount_at("/var/mnt/data").is_none());
        assert!(h.store.get::<MountStatusSpec>("u-data").is_none());
        let volume = h.store.get::<VolumeStatusSpec>("u-data").unwrap();
        assert!(!volume.metadata.has_finalizer(MountController::NAME));
        let request = h.store.get::<MountRequestSpec>("u-data").unwrap();
        assert!(request.metadata.finalizers.is_empty());
    }

    #[test]
    fn nested_mounts_hold_their_parent() {
        let mut h = Harness::new();
        h.volume(
            "/usr/etc",
            VolumeStatusSpec {
                phase: VolumePhase::Ready,
                volume_type: VolumeType::Overlay,
                mount_spec: MountSpec {
                    target_path: "/usr/etc".to_string(),
                    parent_id: "EPHEMERAL".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        h.request("/usr/etc", false, "EPHEMERAL");

        h.reconcile();
        assert!(h.host.mount_at("/usr/etc").is_none());

        h.volume("EPHEMERAL", partition("/var"));
        h.request("EPHEMERAL", false, "");
        h.reconcile();
        h.reconcile();

        let overlay = h.host.mount_at("/usr/etc").unwrap();
        assert_eq!(
            overlay.data,
            "lowerdir=/usr/etc,upperdir=/var/system/overlays/usr-etc-diff,workdir=/var/system/overlays/usr-etc-workdir"
        );
        let parent = h.store.get::<MountStatusSpec>("EPHEMERAL").unwrap();
        assert!(parent.metadata.has_finalizer("MountController-/usr/etc"));

        // the parent cannot go before the child
        h.store
            .teardown::<VolumeStatusSpec>("VolumeManagerController", "EPHEMERAL")
            .unwrap();
        h.reconcile();
        assert!(h.host.mount_at("/var").is_some());

        h.store
            .teardown::<VolumeStatusSpec>("VolumeManagerController", "/usr/etc")
            .unwrap();
        h.reconcile();
        h.reconcile();
        assert!(h.host.mounts().is_empty());
    }

    #[test]
    fn directories_symlinks_and_swap() {
        let mut h = Harness::new();
        h.volume(
            "/var/log",
            VolumeStatusSpec {
                phase: VolumePhase::Ready,
                volume_type: VolumeType::Directory,
                mount_spec: MountSpec {
                    target_path: "/var/log".to_string(),
                    file_mode: 0o755,
                    selinux_label: "system_u:object_r:var_log_t:s0".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        h.volume(
            "/var/run",
            VolumeStatusSpec {
                phase: VolumePhase::Ready,
                volume_type: VolumeType::Symlink,
                mount_spec: MountSpec {
                    target_path: "/var/run".to_string(),
                    ..Default::default()
                },
                symlink_spec: SymlinkProvisioningSpec {
                    symlink_target_path: "/run".to_string(),
                    force: true,
                },
                ..Default::default()
            },
        );
        h.volume(
            "s-swap1",
            VolumeStatusSpec {
                phase: VolumePhase::Ready,
                volume_type: VolumeType::Partition,
                mount_location: "/dev/sda5".to_string(),
                filesystem: FilesystemType::Swap,
                ..Default::default()
            },
        );
        for id in ["/var/log", "/var/run", "s-swap1"] {
            h.request(id, false, "");
        }

        h.reconcile();

        assert!(h.host.directories().contains(&"/var/log".to_string()));
        assert_eq!(
            h.host.settings("/var/log").unwrap().selinux_label,
            "system_u:object_r:var_log_t:s0"
        );
        assert_eq!(h.host.symlink("/var/run").as_deref(), Some("/run"));
        assert_eq!(h.host.swaps(), ["/dev/sda5"]);

        h.store
            .teardown::<MountRequestSpec>("MountRequestController", "s-swap1")
            .unwrap();
        h.reconcile();
        assert!(h.host.swaps().is_empty());
    }

    #[test]
    fn resolve_relative_targets() {
        assert_eq!(resolve_target(Some("/var"), "lib/data"), "/var/lib/data");
        assert_eq!(resolve_target(Some("/var"), "/var/log"), "/var/log");
        assert_eq!(resolve_target(None, "/tmp"), "/tmp");
        assert_eq!(overlay_name("/usr/etc"), "usr-etc");
    }
}
