// SPDX-License-Identifier: GPL-3.0-only

//! Drives every `VolumeConfig` through the phase machine into a
//! `VolumeStatus`.
//!
//! The controller holds a finalizer on each config it works on and on the
//! lifecycle while it runs. Closing a volume starts by tearing its status
//! down, which asks the mount side to let go of it; once nobody holds the
//! status any more the volume is closed. Statuses of removed configs are
//! destroyed after that, statuses closed for shutdown are kept.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use crossbeam_channel::{select, tick};
use storage_runtime::{Controller, ControllerContext, Input, Output};
use storage_types::constants::META_PARTITION_LABEL;
use storage_types::{
    DevicesStatusSpec, DiscoveredVolumeSpec, DiscoveryRefreshRequestSpec,
    DiscoveryRefreshStatusSpec, DiskSpec, MountStatusSpec, Resource, ResourceSpec,
    SystemDiskSpec, VolumeConfigSpec, VolumeLifecycleSpec, VolumePhase, VolumeStatusSpec,
};
use tracing::{debug, info, warn};

use crate::backends::Backends;
use crate::engine::{self, VolumeContext, compare_volume_configs};

const RETRY_INTERVAL: Duration = Duration::from_secs(30);

pub struct VolumeManagerController {
    backends: Backends,
    status_dump: Option<PathBuf>,
    /// Refresh request issued once devices settled.
    refresh_request: Option<i64>,
    /// Config version a volume failed at with an error that is not retried.
    sticky: HashMap<String, u64>,
    should_retry: bool,
}

/// What happens to one volume in this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Open,
    /// Closed and kept, for shutdown.
    Close,
    /// Closed and destroyed, its config or its parent is going away.
    Remove,
}

fn parent_finalizer(child: &str) -> String {
    format!("{}-{}", VolumeManagerController::NAME, child)
}

impl VolumeManagerController {
    pub const NAME: &'static str = "VolumeManagerController";

    pub fn new(backends: Backends) -> Self {
        Self {
            backends,
            status_dump: None,
            refresh_request: None,
            sticky: HashMap::new(),
            should_retry: false,
        }
    }

    /// Write a JSON snapshot of volume and mount statuses after every pass.
    pub fn with_status_dump(mut self, path: PathBuf) -> Self {
        self.status_dump = Some(path);
        self
    }

    /// Whether the last pass left a volume failed with a retried error.
    pub fn should_retry(&self) -> bool {
        self.should_retry
    }

    /// Devices are ready once udev settled and a full re-probe requested
    /// after that has completed.
    fn devices_ready(&mut self, ctx: &ControllerContext) -> anyhow::Result<bool> {
        let settled = ctx
            .get::<DevicesStatusSpec>(DevicesStatusSpec::ID)
            .is_some_and(|status| status.spec.ready);
        if !settled {
            return Ok(false);
        }

        let request = match self.refresh_request {
            Some(request) => request,
            None => {
                let request = ctx
                    .get::<DiscoveryRefreshRequestSpec>(DiscoveryRefreshRequestSpec::ID)
                    .map(|r| r.spec.request)
                    .unwrap_or_default()
                    + 1;
                ctx.modify(
                    DiscoveryRefreshRequestSpec::ID,
                    DiscoveryRefreshRequestSpec::default,
                    |r| r.spec.request = request,
                )
                .context("failed to request discovery refresh")?;
                debug!("devices settled, requested discovery refresh {}", request);
                self.refresh_request = Some(request);
                request
            }
        };

        Ok(ctx
            .get::<DiscoveryRefreshStatusSpec>(DiscoveryRefreshStatusSpec::ID)
            .is_some_and(|status| status.spec.request == request))
    }

    pub fn reconcile(&mut self, ctx: &ControllerContext) -> anyhow::Result<()> {
        let devices_ready = self.devices_ready(ctx)?;

        let lifecycle = ctx.get::<VolumeLifecycleSpec>(VolumeLifecycleSpec::ID);
        let shutting_down = lifecycle
            .as_ref()
            .is_some_and(|lifecycle| lifecycle.metadata.is_tearing_down());
        let holds_lifecycle = lifecycle
            .as_ref()
            .is_some_and(|lifecycle| lifecycle.metadata.has_finalizer(Self::NAME));

        if lifecycle.is_some() && !shutting_down && !holds_lifecycle {
            ctx.add_finalizer::<VolumeLifecycleSpec>(VolumeLifecycleSpec::ID, Self::NAME)
                .context("failed to hold the volume lifecycle")?;
        }

        let mut configs = ctx.list::<VolumeConfigSpec>();
        configs.sort_by(|a, b| match compare_volume_configs(&a.spec, &b.spec) {
            Ordering::Equal => a.id().cmp(b.id()),
            other => other,
        });

        for config in &configs {
            if config.metadata.is_running() && !config.metadata.has_finalizer(Self::NAME) {
                ctx.add_finalizer::<VolumeConfigSpec>(config.id(), Self::NAME)
                    .with_context(|| format!("failed to hold volume config {}", config.id()))?;
            }
        }

        let discovered = ctx.list::<DiscoveredVolumeSpec>();
        let disks = ctx.list::<DiskSpec>();
        let system_disk = ctx
            .get::<SystemDiskSpec>(SystemDiskSpec::ID)
            .map(|system_disk| system_disk.spec.disk_id);

        let mut statuses: HashMap<String, Resource<VolumeStatusSpec>> = ctx
            .list::<VolumeStatusSpec>()
            .into_iter()
            .map(|status| (status.id().to_string(), status))
            .collect();

        let mut fully_provisioned_wave = i32::MAX;
        let mut seen = BTreeSet::new();
        self.should_retry = false;

        let orphans: Vec<Resource<VolumeStatusSpec>> = statuses
            .values()
            .filter(|status| !configs.iter().any(|config| config.id() == status.id()))
            .cloned()
            .collect();

        for config in &configs {
            let id = config.id();
            seen.insert(id.to_string());

            let parent_tearing_down = !config.spec.parent_id.is_empty()
                && statuses
                    .get(&config.spec.parent_id)
                    .is_some_and(|parent| parent.metadata.is_tearing_down());
            let status_tearing_down = statuses
                .get(id)
                .is_some_and(|status| status.metadata.is_tearing_down());

            // a torn down parent takes its children with it; a status torn
            // down in an earlier pass finishes going away
            let mode = if config.metadata.is_tearing_down() {
                Mode::Remove
            } else if shutting_down {
                Mode::Close
            } else if parent_tearing_down || status_tearing_down {
                Mode::Remove
            } else {
                Mode::Open
            };

            let previous_wave_provisioned = config.spec.provisioning.wave <= fully_provisioned_wave;

            let ctx_in = PassInput {
                devices_ready,
                previous_wave_provisioned,
                discovered: &discovered,
                disks: &disks,
                system_disk: system_disk.as_deref(),
            };

            let phase = self.reconcile_volume(ctx, &ctx_in, id, &config.spec, config.metadata.version, mode, &mut statuses)?;

            if mode == Mode::Open && phase != Some(VolumePhase::Ready) {
                fully_provisioned_wave =
                    fully_provisioned_wave.min(config.spec.provisioning.wave.saturating_sub(1));
            }
        }

        for status in orphans {
            let ctx_in = PassInput {
                devices_ready,
                previous_wave_provisioned: true,
                discovered: &discovered,
                disks: &disks,
                system_disk: system_disk.as_deref(),
            };
            let config = VolumeConfigSpec {
                volume_type: status.spec.volume_type,
                parent_id: status.spec.parent_id.clone(),
                ..Default::default()
            };
            self.reconcile_volume(ctx, &ctx_in, status.id(), &config, 0, Mode::Remove, &mut statuses)?;
        }

        self.sticky.retain(|id, _| seen.contains(id));

        if shutting_down && holds_lifecycle {
            let all_closed = statuses
                .values()
                .filter(|status| status.id() != META_PARTITION_LABEL)
                .all(|status| status.spec.phase == VolumePhase::Closed);

            if all_closed {
                ctx.remove_finalizer::<VolumeLifecycleSpec>(VolumeLifecycleSpec::ID, Self::NAME)
                    .context("failed to release the volume lifecycle")?;
                info!("all volumes closed, released the volume lifecycle");
            }
        }

        self.dump_statuses(ctx);

        Ok(())
    }

    /// Step one volume and write its status; returns the phase it ended in,
    /// or `None` when the status is gone or untouched.
    #[allow(clippy::too_many_arguments)]
    fn reconcile_volume(
        &mut self,
        ctx: &ControllerContext,
        input: &PassInput<'_>,
        id: &str,
        config: &VolumeConfigSpec,
        config_version: u64,
        mode: Mode,
        statuses: &mut HashMap<String, Resource<VolumeStatusSpec>>,
    ) -> anyhow::Result<Option<VolumePhase>> {
        let existing = statuses.get(id).cloned();

        if mode != Mode::Open {
            let Some(existing) = existing.as_ref() else {
                if mode == Mode::Remove {
                    self.release_parent(ctx, id, &config.parent_id, statuses)?;
                    self.release_config(ctx, id)?;
                }
                return Ok(None);
            };

            // the mount side and the children let go of a status once it is
            // torn down
            let released = ctx
                .teardown::<VolumeStatusSpec>(id)
                .with_context(|| format!("failed to tear down volume status {}", id))?;
            if !released {
                debug!("volume {} is still in use", id);
                let phase = existing.spec.phase;
                if let Some(status) = ctx.get::<VolumeStatusSpec>(id) {
                    statuses.insert(id.to_string(), status);
                }
                return Ok(Some(phase));
            }
        } else if !config.parent_id.is_empty() {
            match statuses.get(&config.parent_id) {
                Some(parent) if parent.metadata.is_running() => {
                    if !parent.metadata.has_finalizer(&parent_finalizer(id)) {
                        ctx.add_finalizer::<VolumeStatusSpec>(&config.parent_id, &parent_finalizer(id))
                            .with_context(|| format!("failed to hold parent of volume {}", id))?;
                    }
                }
                _ => {
                    debug!("volume {} waits for its parent {}", id, config.parent_id);
                    let status = self.write_status(ctx, id, existing.as_ref(), |_| {})?;
                    let phase = status.spec.phase;
                    statuses.insert(id.to_string(), status);
                    return Ok(Some(phase));
                }
            }
        }

        let mut spec = existing
            .as_ref()
            .map(|status| status.spec.clone())
            .unwrap_or_default();
        let before = spec.phase;

        spec.volume_type = config.volume_type;
        spec.parent_id = config.parent_id.clone();
        if mode == Mode::Open {
            spec.mount_spec = config.mount.clone();
            spec.symlink_spec = config.symlink.clone();
        }

        let skip = match mode {
            Mode::Open if spec.phase == VolumePhase::Failed => {
                self.sticky.get(id) == Some(&config_version)
            }
            Mode::Open => !input.devices_ready && !config.volume_type.is_trivial(),
            _ => false,
        };

        if !skip {
            self.sticky.remove(id);

            let mut volume = VolumeContext {
                id,
                config,
                status: &mut spec,
                discovered: input.discovered,
                disks: input.disks,
                system_disk: input.system_disk,
                devices_ready: input.devices_ready,
                previous_wave_provisioned: input.previous_wave_provisioned,
                backends: &self.backends,
            };

            match engine::process(&mut volume, mode != Mode::Open) {
                Ok(()) => spec.error_message.clear(),
                Err(err) => {
                    if err.kind.is_retried() {
                        self.should_retry = true;
                    } else if mode == Mode::Open {
                        self.sticky.insert(id.to_string(), config_version);
                    }

                    if spec.phase != VolumePhase::Failed {
                        spec.pre_fail_phase = spec.phase;
                    }
                    spec.phase = VolumePhase::Failed;
                    spec.error_message = err.to_string();

                    if mode != Mode::Open {
                        // keep trying to close on the retry ticker
                        self.should_retry = true;
                    }
                }
            }
        }

        if before != spec.phase && !spec.volume_type.is_quiet() {
            info!(
                volume = %id,
                phase = %format_args!("{} -> {}", before, spec.phase),
                location = %spec.location,
                mount_location = %spec.mount_location,
                parent_location = %spec.parent_location,
                error = %spec.error_message,
                "volume status"
            );
        } else if spec.phase == VolumePhase::Failed && existing.as_ref().is_some_and(|s| s.spec.error_message != spec.error_message) {
            warn!(volume = %id, error = %spec.error_message, "volume failed");
        }

        if mode == Mode::Remove && spec.phase == VolumePhase::Closed {
            match ctx.destroy::<VolumeStatusSpec>(id) {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err).with_context(|| format!("failed to destroy volume status {}", id)),
            }
            statuses.remove(id);
            self.release_parent(ctx, id, &config.parent_id, statuses)?;
            self.release_config(ctx, id)?;
            debug!("volume {} removed", id);
            return Ok(None);
        }

        let labels = ctx
            .get::<VolumeConfigSpec>(id)
            .map(|config| config.metadata.labels)
            .unwrap_or_default();
        let status = self.write_status(ctx, id, existing.as_ref(), move |status| {
            status.spec = spec;
            status.metadata.labels.extend(labels);
        })?;

        if mode == Mode::Close && status.spec.phase == VolumePhase::Closed {
            self.release_parent(ctx, id, &config.parent_id, statuses)?;
        }

        let phase = status.spec.phase;
        statuses.insert(id.to_string(), status);
        Ok(Some(phase))
    }

    fn write_status<F>(
        &self,
        ctx: &ControllerContext,
        id: &str,
        existing: Option<&Resource<VolumeStatusSpec>>,
        f: F,
    ) -> anyhow::Result<Resource<VolumeStatusSpec>>
    where
        F: FnOnce(&mut Resource<VolumeStatusSpec>),
    {
        if existing.is_none() {
            debug!("volume {} created", id);
        }
        ctx.modify_any_phase(id, VolumeStatusSpec::default, f)
            .with_context(|| format!("failed to write volume status {}", id))
    }

    fn release_parent(
        &self,
        ctx: &ControllerContext,
        id: &str,
        parent_id: &str,
        statuses: &mut HashMap<String, Resource<VolumeStatusSpec>>,
    ) -> anyhow::Result<()> {
        if parent_id.is_empty() || !statuses.contains_key(parent_id) {
            return Ok(());
        }

        match ctx.remove_finalizer::<VolumeStatusSpec>(parent_id, &parent_finalizer(id)) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err).with_context(|| format!("failed to release parent of {}", id)),
        }

        if let Some(parent) = ctx.get::<VolumeStatusSpec>(parent_id) {
            statuses.insert(parent_id.to_string(), parent);
        }
        Ok(())
    }

    /// Drop the hold on a config that is going away; a config that is still
    /// running keeps it, the volume comes back once its parent does.
    fn release_config(&self, ctx: &ControllerContext, id: &str) -> anyhow::Result<()> {
        if ctx
            .get::<VolumeConfigSpec>(id)
            .is_some_and(|config| config.metadata.is_running())
        {
            return Ok(());
        }

        match ctx.remove_finalizer::<VolumeConfigSpec>(id, Self::NAME) {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to release volume config {}", id)),
        }
    }

    fn dump_statuses(&self, ctx: &ControllerContext) {
        let Some(path) = &self.status_dump else {
            return;
        };

        let dump = ctx
            .store()
            .dump(&[VolumeStatusSpec::TYPE, MountStatusSpec::TYPE]);
        let result = serde_json::to_vec_pretty(&dump)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| fs::write(path, bytes).map_err(anyhow::Error::from));

        if let Err(err) = result {
            warn!("failed to write status dump to {}: {:#}", path.display(), err);
        }
    }
}

/// Inputs shared by every volume of one pass.
struct PassInput<'a> {
    devices_ready: bool,
    previous_wave_provisioned: bool,
    discovered: &'a [Resource<DiscoveredVolumeSpec>],
    disks: &'a [Resource<DiskSpec>],
    system_disk: Option<&'a str>,
}

impl Controller for VolumeManagerController {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::of::<VolumeConfigSpec>(),
            Input::of::<VolumeStatusSpec>(),
            Input::of::<DiscoveredVolumeSpec>(),
            Input::of::<DiskSpec>(),
            Input::id::<SystemDiskSpec>(SystemDiskSpec::ID),
            Input::id::<DevicesStatusSpec>(DevicesStatusSpec::ID),
            Input::id::<DiscoveryRefreshStatusSpec>(DiscoveryRefreshStatusSpec::ID),
            Input::id::<VolumeLifecycleSpec>(VolumeLifecycleSpec::ID),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![
            Output::exclusive::<VolumeStatusSpec>(),
            Output::exclusive::<DiscoveryRefreshRequestSpec>(),
        ]
    }

    fn run(&mut self, ctx: &mut ControllerContext) -> anyhow::Result<()> {
        let ticker = tick(RETRY_INTERVAL);

        loop {
            select! {
                recv(ctx.done()) -> _ => return Ok(()),
                recv(ctx.events()) -> event => {
                    if event.is_err() {
                        return Ok(());
                    }
                }
                recv(ticker) -> _ => {
                    if !self.should_retry {
                        continue;
                    }
                    debug!("retrying failed volumes");
                }
            }

            self.reconcile(ctx)?;
            ctx.reset_restart_backoff();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use storage_contracts::{PartitionTableBackend, VolumeError};
    use storage_expr::{EnvKind, Expression};
    use storage_runtime::Store;
    use storage_testing::host::superblock;
    use storage_testing::{FakeDisk, FakeHost, TestContext};
    use storage_types::{
        DiskSelector, FilesystemSpec, FilesystemType, LocatorSpec, MIB, MountSpec, PartitionSpec,
        ProvisioningSpec, VolumeType,
    };

    use crate::controllers::testing;

    const CONFIG_OWNER: &str = "VolumeConfigController";

    struct Harness {
        store: Arc<Store>,
        host: Arc<FakeHost>,
        test: TestContext,
        controller: VolumeManagerController,
    }

    impl Harness {
        fn new() -> Self {
            let store = Store::new();
            let host = Arc::new(FakeHost::new());
            let test = TestContext::new(&store, VolumeManagerController::NAME);
            let controller = VolumeManagerController::new(testing::backends(&host));
            Self {
                store,
                host,
                test,
                controller,
            }
        }

        /// Mark devices settled and answer the refresh request.
        fn devices_ready(&mut self) {
            self.store
                .modify("DevicesStatusController", DevicesStatusSpec::ID, DevicesStatusSpec::default, |s| {
                    s.spec.ready = true
                })
                .unwrap();
            self.reconcile();
            let request = self
                .store
                .get::<DiscoveryRefreshRequestSpec>(DiscoveryRefreshRequestSpec::ID)
                .unwrap()
                .spec
                .request;
            self.store
                .modify(
                    "DiscoveryController",
                    DiscoveryRefreshStatusSpec::ID,
                    DiscoveryRefreshStatusSpec::default,
                    |s| s.spec.request = request,
                )
                .unwrap();
        }

        fn config(&self, id: &str, spec: VolumeConfigSpec) {
            self.store
                .modify(CONFIG_OWNER, id, VolumeConfigSpec::default, |c| c.spec = spec)
                .unwrap();
        }

        fn discovered(&self, id: &str, spec: DiscoveredVolumeSpec) {
            self.store
                .modify("DiscoveryController", id, DiscoveredVolumeSpec::default, |v| v.spec = spec)
                .unwrap();
        }

        fn reconcile(&mut self) {
            self.controller.reconcile(&self.test.ctx).unwrap();
        }

        fn status(&self, id: &str) -> Option<Resource<VolumeStatusSpec>> {
            self.store.get::<VolumeStatusSpec>(id)
        }

        fn phase(&self, id: &str) -> VolumePhase {
            self.status(id).unwrap().spec.phase
        }
    }

    fn tmpfs(target: &str) -> VolumeConfigSpec {
        VolumeConfigSpec {
            volume_type: VolumeType::Tmpfs,
            mount: MountSpec {
                target_path: target.to_string(),
                file_mode: 0o1777,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn located(label: &str, wave: i32) -> VolumeConfigSpec {
        VolumeConfigSpec {
            volume_type: VolumeType::Partition,
            locator: LocatorSpec::Match(Expression::new(
                format!("volume.partition_label == \"{}\"", label),
                EnvKind::VolumeLocator,
            )),
            provisioning: ProvisioningSpec {
                wave,
                disk_selector: DiskSelector {
                    match_expr: Expression::new("system_disk", EnvKind::DiskLocator),
                    ..Default::default()
                },
                partition_spec: PartitionSpec {
                    min_size: 100 * MIB,
                    max_size: 100 * MIB,
                    label: label.to_string(),
                    ..Default::default()
                },
                filesystem_spec: FilesystemSpec {
                    filesystem_type: FilesystemType::Xfs,
                    label: label.to_string(),
                },
            },
            ..Default::default()
        }
    }

    fn partition(dev: &str, label: &str, content: storage_contracts::ProbeResult) -> DiscoveredVolumeSpec {
        DiscoveredVolumeSpec {
            dev_path: dev.to_string(),
            parent: "sda".to_string(),
            parent_dev_path: "/dev/sda".to_string(),
            device_type: "partition".to_string(),
            size: 100 * MIB,
            name: content.name,
            uuid: content.uuid,
            label: content.label,
            partition_label: label.to_string(),
            partition_index: 1,
            ..Default::default()
        }
    }

    #[test]
    fn trivial_volumes_are_ready_before_devices() {
        let mut h = Harness::new();
        crate::lifecycle::start(&h.store).unwrap();
        h.config("/tmp", tmpfs("/tmp"));
        h.config("STATE", located("STATE", -1));

        h.reconcile();

        assert_eq!(h.phase("/tmp"), VolumePhase::Ready);
        assert_eq!(h.phase("STATE"), VolumePhase::Waiting);
        assert_eq!(h.status("/tmp").unwrap().spec.mount_spec.target_path, "/tmp");

        let config = h.store.get::<VolumeConfigSpec>("/tmp").unwrap();
        assert!(config.metadata.has_finalizer(VolumeManagerController::NAME));
        let lifecycle = h.store.get::<VolumeLifecycleSpec>(VolumeLifecycleSpec::ID).unwrap();
        assert!(lifecycle.metadata.has_finalizer(VolumeManagerController::NAME));
    }

    #[test]
    fn devices_wait_for_the_refresh_round_trip() {
        let mut h = Harness::new();
        h.store
            .modify("DevicesStatusController", DevicesStatusSpec::ID, DevicesStatusSpec::default, |s| {
                s.spec.ready = true
            })
            .unwrap();

        assert!(!h.controller.devices_ready(&h.test.ctx).unwrap());
        let request = h
            .store
            .get::<DiscoveryRefreshRequestSpec>(DiscoveryRefreshRequestSpec::ID)
            .unwrap();
        assert_eq!(request.spec.request, 1);

        // the request is issued once
        assert!(!h.controller.devices_ready(&h.test.ctx).unwrap());
        assert_eq!(
            h.store
                .get::<DiscoveryRefreshRequestSpec>(DiscoveryRefreshRequestSpec::ID)
                .unwrap()
                .metadata
                .version,
            request.metadata.version
        );

        h.store
            .modify(
                "DiscoveryController",
                DiscoveryRefreshStatusSpec::ID,
                DiscoveryRefreshStatusSpec::default,
                |s| s.spec.request = 1,
            )
            .unwrap();
        assert!(h.controller.devices_ready(&h.test.ctx).unwrap());
    }

    #[test]
    fn existing_volume_is_formatted_and_ready() {
        let mut h = Harness::new();
        h.host.add_disk(
            "/dev/sda",
            FakeDisk::blank(8 * storage_types::GIB).with_partition("STATE", 100 * MIB, Default::default()),
        );
        h.devices_ready();
        h.discovered("sda1", partition("/dev/sda1", "STATE", Default::default()));
        h.config("STATE", located("STATE", -1));

        h.reconcile();

        let status = h.status("STATE").unwrap().spec;
        assert_eq!(status.phase, VolumePhase::Ready);
        assert_eq!(status.location, "/dev/sda1");
        assert_eq!(status.mount_location, "/dev/sda1");
        assert_eq!(status.parent_location, "/dev/sda");
        assert_eq!(h.host.content("/dev/sda1").unwrap().name, "xfs");
    }

    #[test]
    fn lower_wave_blocks_provisioning_of_higher_waves() {
        let mut h = Harness::new();
        h.devices_ready();
        // nothing matches `system_disk`, so wave -1 cannot provision
        h.config("STATE", located("STATE", -1));
        h.config("u-data", located("u-data", 0));

        h.reconcile();

        assert_eq!(h.phase("STATE"), VolumePhase::Failed);
        assert!(h.status("STATE").unwrap().spec.error_message.contains("no disks matched"));
        assert_eq!(h.phase("u-data"), VolumePhase::Waiting);
        assert!(h.controller.should_retry());
    }

    #[test]
    fn config_errors_stick_until_the_config_changes() {
        let mut h = Harness::new();
        h.devices_ready();
        let mut broken = located("STATE", -1);
        broken.locator = LocatorSpec::None;
        h.config("STATE", broken.clone());

        h.reconcile();
        let status = h.status("STATE").unwrap();
        assert_eq!(status.spec.phase, VolumePhase::Failed);
        assert_eq!(status.spec.error_message, "volume locator is not set");
        assert!(!h.controller.should_retry());

        h.reconcile();
        assert_eq!(h.status("STATE").unwrap().metadata.version, status.metadata.version);

        h.host.add_disk(
            "/dev/sda",
            FakeDisk::blank(8 * storage_types::GIB)
                .with_partition("STATE", 100 * MIB, superblock("xfs", "STATE")),
        );
        h.discovered("sda1", partition("/dev/sda1", "STATE", superblock("xfs", "STATE")));
        h.config("STATE", located("STATE", -1));
        h.reconcile();
        assert_eq!(h.phase("STATE"), VolumePhase::Ready);
        assert!(h.status("STATE").unwrap().spec.error_message.is_empty());
    }

    #[test]
    fn retryable_errors_are_recorded_with_the_phase_they_hit() {
        let mut h = Harness::new();
        h.host.add_disk(
            "/dev/sda",
            FakeDisk::blank(8 * storage_types::GIB).with_partition("STATE", 100 * MIB, Default::default()),
        );
        h.host.fail("format", VolumeError::retryable("device busy"));
        h.devices_ready();
        h.discovered("sda1", partition("/dev/sda1", "STATE", Default::default()));
        h.config("STATE", located("STATE", -1));

        h.reconcile();
        let status = h.status("STATE").unwrap().spec;
        assert_eq!(status.phase, VolumePhase::Failed);
        assert_eq!(status.pre_fail_phase, VolumePhase::Prepared);
        assert!(h.controller.should_retry());

        h.host.heal("format");
        h.reconcile();
        assert_eq!(h.phase("STATE"), VolumePhase::Ready);
        assert!(!h.controller.should_retry());
    }

    #[test]
    fn removed_configs_wait_for_the_status_holders() {
        let mut h = Harness::new();
        h.config("/tmp", tmpfs("/tmp"));
        h.reconcile();
        h.store.add_finalizer::<VolumeStatusSpec>("/tmp", "MountController").unwrap();

        h.store.teardown::<VolumeConfigSpec>(CONFIG_OWNER, "/tmp").unwrap();
        h.reconcile();

        let status = h.status("/tmp").unwrap();
        assert!(status.metadata.is_tearing_down());
        assert_eq!(status.spec.phase, VolumePhase::Ready);

        h.store.remove_finalizer::<VolumeStatusSpec>("/tmp", "MountController").unwrap();
        h.reconcile();

        assert!(h.status("/tmp").is_none());
        let config = h.store.get::<VolumeConfigSpec>("/tmp").unwrap();
        assert!(config.metadata.finalizers.is_empty());
    }

    #[test]
    fn children_hold_their_parent() {
        let mut h = Harness::new();
        h.config("EPHEMERAL", tmpfs("/var"));
        let mut child = tmpfs("/var/log");
        child.volume_type = VolumeType::Directory;
        child.parent_id = "EPHEMERAL".to_string();
        h.config("/var/log", child);

        h.reconcile();
        // the parent status did not exist yet when the child sorted first
        h.reconcile();

        let parent = h.status("EPHEMERAL").unwrap();
        assert!(parent.metadata.has_finalizer("VolumeManagerController-/var/log"));
        assert_eq!(h.phase("/var/log"), VolumePhase::Ready);

        crate::lifecycle::start(&h.store).unwrap();
        h.reconcile();
        crate::lifecycle::begin_shutdown(&h.store).unwrap();
        h.reconcile();

        assert_eq!(h.phase("/var/log"), VolumePhase::Closed);
        let parent = h.status("EPHEMERAL").unwrap();
        assert!(!parent.metadata.has_finalizer("VolumeManagerController-/var/log"));
    }

    #[test]
    fn encryption_and_format_hold_the_disk() {
        let mut h = Harness::new();
        h.host.add_disk(
            "/dev/sda",
            FakeDisk::blank(8 * storage_types::GIB).with_partition("STATE", 100 * MIB, Default::default()),
        );
        h.devices_ready();
        h.discovered("sda1", partition("/dev/sda1", "STATE", Default::default()));

        let mut state = located("STATE", -1);
        state.encryption = storage_types::EncryptionSpec {
            provider: storage_types::EncryptionProviderType::Luks2,
            keys: vec![storage_types::EncryptionKey {
                slot: 0,
                kind: storage_types::EncryptionKeyKind::Static {
                    passphrase: b"secret".to_vec(),
                },
            }],
            ..Default::default()
        };
        h.config("STATE", state);
        h.reconcile();

        assert_eq!(h.phase("STATE"), VolumePhase::Ready);
        assert_eq!(
            h.host.log(),
            [
                "lock /dev/sda",
                "encrypt /dev/sda1",
                "open sda1-encrypted",
                "unlock /dev/sda",
                "lock /dev/sda",
                "format /dev/mapper/sda1-encrypted xfs",
                "unlock /dev/sda",
            ]
        );
        assert!(!h.host.is_locked("/dev/sda"));
    }

    #[test]
    fn busy_disk_fails_the_step_and_is_retried() {
        let mut h = Harness::new();
        h.host.add_disk(
            "/dev/sda",
            FakeDisk::blank(8 * storage_types::GIB).with_partition("STATE", 100 * MIB, Default::default()),
        );
        h.devices_ready();
        h.discovered("sda1", partition("/dev/sda1", "STATE", Default::default()));
        h.config("STATE", located("STATE", -1));

        let held = h.host.lock_disk("/dev/sda").unwrap();
        h.reconcile();

        let status = h.status("STATE").unwrap().spec;
        assert_eq!(status.phase, VolumePhase::Failed);
        assert_eq!(status.pre_fail_phase, VolumePhase::Prepared);
        assert!(status.error_message.contains("error locking /dev/sda"), "{}", status.error_message);
        assert!(h.host.formatted().is_empty());
        assert!(h.controller.should_retry());

        drop(held);
        h.reconcile();
        assert_eq!(h.phase("STATE"), VolumePhase::Ready);
    }

    #[test]
    fn fresh_filesystem_uuid_is_recorded() {
        let mut h = Harness::new();
        h.host.add_disk(
            "/dev/sda",
            FakeDisk::blank(8 * storage_types::GIB).with_partition("STATE", 100 * MIB, Default::default()),
        );
        h.devices_ready();
        h.discovered("sda1", partition("/dev/sda1", "STATE", Default::default()));
        h.config("STATE", located("STATE", -1));

        h.reconcile();

        let status = h.status("STATE").unwrap().spec;
        assert_eq!(status.phase, VolumePhase::Ready);
        let formatted = h.host.content("/dev/sda1").unwrap();
        assert!(!formatted.uuid.is_empty());
        assert_eq!(status.uuid, formatted.uuid);
    }

    #[test]
    fn removing_the_parent_takes_its_children_down() {
        let mut h = Harness::new();
        h.config("EPHEMERAL", tmpfs("/var"));
        let mut child = tmpfs("/var/log");
        child.volume_type = VolumeType::Directory;
        child.parent_id = "EPHEMERAL".to_string();
        h.config("/var/log", child);
        h.reconcile();
        h.reconcile();
        assert_eq!(h.phase("/var/log"), VolumePhase::Ready);

        h.store.teardown::<VolumeConfigSpec>(CONFIG_OWNER, "EPHEMERAL").unwrap();
        for _ in 0..4 {
            h.reconcile();
        }

        assert!(h.status("EPHEMERAL").is_none());
        let config = h.store.get::<VolumeConfigSpec>("EPHEMERAL").unwrap();
        assert!(config.metadata.finalizers.is_empty());

        // the child config stays and waits for a new parent
        assert_eq!(h.phase("/var/log"), VolumePhase::Waiting);
        let child = h.store.get::<VolumeConfigSpec>("/var/log").unwrap();
        assert!(child.metadata.has_finalizer(VolumeManagerController::NAME));

        h.store.destroy::<VolumeConfigSpec>(CONFIG_OWNER, "EPHEMERAL").unwrap();
        h.config("EPHEMERAL", tmpfs("/var"));
        h.reconcile();
        h.reconcile();
        assert_eq!(h.phase("/var/log"), VolumePhase::Ready);
        let parent = h.status("EPHEMERAL").unwrap();
        assert!(parent.metadata.has_finalizer("VolumeManagerController-/var/log"));
    }

    #[test]
    fn shutdown_closes_encrypted_volumes_and_releases_the_lifecycle() {
        let mut h = Harness::new();
        crate::lifecycle::start(&h.store).unwrap();
        h.host.add_disk(
            "/dev/sda",
            FakeDisk::blank(8 * storage_types::GIB).with_partition("STATE", 100 * MIB, Default::default()),
        );
        h.devices_ready();
        h.discovered("sda1", partition("/dev/sda1", "STATE", Default::default()));

        let mut state = located("STATE", -1);
        state.encryption = storage_types::EncryptionSpec {
            provider: storage_types::EncryptionProviderType::Luks2,
            keys: vec![storage_types::EncryptionKey {
                slot: 0,
                kind: storage_types::EncryptionKeyKind::Static {
                    passphrase: b"secret".to_vec(),
                },
            }],
            ..Default::default()
        };
        h.config("STATE", state);
        h.config("/tmp", tmpfs("/tmp"));
        h.reconcile();

        let status = h.status("STATE").unwrap().spec;
        assert_eq!(status.phase, VolumePhase::Ready);
        assert_eq!(status.mount_location, "/dev/mapper/sda1-encrypted");
        h.store.add_finalizer::<VolumeStatusSpec>("STATE", "MountController").unwrap();

        crate::lifecycle::begin_shutdown(&h.store).unwrap();
        h.reconcile();

        // still mounted
        assert_eq!(h.phase("STATE"), VolumePhase::Ready);
        assert_eq!(h.phase("/tmp"), VolumePhase::Closed);
        assert!(!crate::lifecycle::is_released(&h.store));

        h.store.remove_finalizer::<VolumeStatusSpec>("STATE", "MountController").unwrap();
        h.reconcile();

        assert_eq!(h.phase("STATE"), VolumePhase::Closed);
        assert!(h.host.opened().is_empty());
        assert!(crate::lifecycle::is_released(&h.store));
    }

    #[test]
    fn status_dump_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let mut h = Harness::new();
        h.controller = VolumeManagerController::new(testing::backends(&h.host)).with_status_dump(path.clone());
        h.config("/tmp", tmpfs("/tmp"));

        h.reconcile();

        let dump: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        let statuses = dump[VolumeStatusSpec::TYPE].as_array().unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0]["spec"]["phase"], "ready");
    }
}
