// SPDX-License-Identifier: GPL-3.0-only

//! A whole machine on top of [`FakeHost`]: the device controllers are
//! replaced by direct writes, everything above them runs for real.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use storage_runtime::Store;
use storage_testing::{FakeHost, RecordingRunner, TestContext};
use storage_types::{DeviceSpec, DevicesStatusSpec, DiskSpec, VolumePhase, VolumeStatusSpec};
use storage_volumes::controllers::discovery::DiscoveryController;
use storage_volumes::controllers::mount::MountController;
use storage_volumes::controllers::mount_request::MountRequestController;
use storage_volumes::controllers::mount_status::MountStatusController;
use storage_volumes::controllers::system_disk::SystemDiskController;
use storage_volumes::controllers::volume_config::VolumeConfigController;
use storage_volumes::controllers::volume_manager::VolumeManagerController;
use storage_volumes::{Backends, LocalKeys, MachineConfig, lifecycle};

pub const NODE_UUID: &str = "4c4c4544-0039-3010-8048-b7c04f334c32";

const ROUNDS: usize = 80;
const SCSI_MAJOR: u32 = 8;

pub struct Machine {
    pub store: Arc<Store>,
    pub host: Arc<FakeHost>,
    disks: Vec<String>,
    generation: u64,
    /// Reconcile errors seen during the last round.
    pub errors: Vec<String>,

    discovery: (DiscoveryController, TestContext),
    system_disk: (SystemDiskController, TestContext),
    volume_config: Option<(VolumeConfigController, TestContext)>,
    volume_manager: (VolumeManagerController, TestContext),
    mount_request: (MountRequestController, TestContext),
    mount: (MountController, TestContext),
    mount_status: (MountStatusController, TestContext),
}

fn backends(host: &Arc<FakeHost>) -> Backends {
    Backends::from_host(
        host.clone(),
        Arc::new(LocalKeys::new(NODE_UUID)),
        Arc::new(RecordingRunner::new()),
    )
}

fn device_id(dev_path: &str) -> String {
    Path::new(dev_path)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

impl Machine {
    /// Boot with the configuration controller turning `machine` into volumes.
    pub fn boot(host: &Arc<FakeHost>, disks: &[&str], machine: Option<&str>) -> Self {
        let machine = machine.map(|text| MachineConfig::from_toml_str(text).unwrap());
        let mut this = Self::build(host, disks);
        let store = this.store.clone();
        this.volume_config = Some((
            VolumeConfigController::new(backends(host), machine, false),
            TestContext::new(&store, VolumeConfigController::NAME),
        ));
        this
    }

    /// Boot without configuration; tests write `VolumeConfig`s themselves.
    pub fn bare(host: &Arc<FakeHost>, disks: &[&str]) -> Self {
        Self::build(host, disks)
    }

    fn build(host: &Arc<FakeHost>, disks: &[&str]) -> Self {
        let store = Store::new();
        lifecycle::start(&store).unwrap();

        Self {
            host: host.clone(),
            disks: disks.iter().map(|disk| disk.to_string()).collect(),
            generation: 0,
            errors: Vec::new(),
            discovery: (
                DiscoveryController::new(backends(host), "/dev"),
                TestContext::new(&store, DiscoveryController::NAME),
            ),
            system_disk: (
                SystemDiskController::new(),
                TestContext::new(&store, SystemDiskController::NAME),
            ),
            volume_config: None,
            volume_manager: (
                VolumeManagerController::new(backends(host)),
                TestContext::new(&store, VolumeManagerController::NAME),
            ),
            mount_request: (
                MountRequestController::new(),
                TestContext::new(&store, MountRequestController::NAME),
            ),
            mount: (
                MountController::new(backends(host)),
                TestContext::new(&store, MountController::NAME),
            ),
            mount_status: (
                MountStatusController::new(),
                TestContext::new(&store, MountStatusController::NAME),
            ),
            store,
        }
    }

    /// Publish what the host has as `Device` and `Disk` resources.
    fn sync_devices(&mut self) {
        self.generation += 1;
        let mut present = Vec::new();

        for dev_path in &self.disks {
            let Some(disk) = self.host.disk(dev_path) else {
                continue;
            };
            let id = device_id(dev_path);

            let generation = self.generation;
            self.store
                .modify("DevicesController", &id, DeviceSpec::default, |device| {
                    device.spec = DeviceSpec {
                        device_type: "disk".to_string(),
                        major: SCSI_MAJOR,
                        dev_name: id.clone(),
                        generation,
                        ..Default::default()
                    };
                })
                .unwrap();
            self.store
                .modify("DisksController", &id, DiskSpec::default, |resource| {
                    resource.spec = DiskSpec {
                        dev_path: dev_path.clone(),
                        size: disk.size,
                        io_size: disk.io_size,
                        sector_size: disk.sector_size,
                        ..Default::default()
                    };
                })
                .unwrap();
            present.push(id.clone());

            for partition in &disk.partitions {
                let part_id = device_id(&partition.dev_path);
                self.store
                    .modify("DevicesController", &part_id, DeviceSpec::default, |device| {
                        device.spec = DeviceSpec {
                            device_type: "partition".to_string(),
                            major: SCSI_MAJOR,
                            dev_name: part_id.clone(),
                            partition_name: partition.partition_label.clone(),
                            partition_number: partition.number,
                            parent: id.clone(),
                            generation,
                            ..Default::default()
                        };
                    })
                    .unwrap();
                present.push(part_id);
            }
        }

        for device in self.store.list::<DeviceSpec>() {
            if !present.iter().any(|id| id == device.id()) {
                self.store
                    .destroy::<DeviceSpec>("DevicesController", device.id())
                    .unwrap();
            }
        }
        for disk in self.store.list::<DiskSpec>() {
            if !present.iter().any(|id| id == disk.id()) {
                self.store.destroy::<DiskSpec>("DisksController", disk.id()).unwrap();
            }
        }

        self.store
            .modify(
                "DevicesStatusController",
                DevicesStatusSpec::ID,
                DevicesStatusSpec::default,
                |status| status.spec.ready = true,
            )
            .unwrap();
    }

    /// One pass of every controller, bottom up.
    pub fn step(&mut self) {
        self.sync_devices();
        let mut errors = Vec::new();
        let mut record = |result: anyhow::Result<()>| {
            if let Err(err) = result {
                errors.push(format!("{:#}", err));
            }
        };

        let (discovery, ctx) = &mut self.discovery;
        record(discovery.process_events(&ctx.ctx));
        record(discovery.rescan(&ctx.ctx));

        let (system_disk, ctx) = &mut self.system_disk;
        record(system_disk.reconcile(&ctx.ctx));

        if let Some((volume_config, ctx)) = &mut self.volume_config {
            record(volume_config.reconcile(&ctx.ctx));
        }

        let (volume_manager, ctx) = &mut self.volume_manager;
        record(volume_manager.reconcile(&ctx.ctx));

        let (mount_request, ctx) = &mut self.mount_request;
        record(mount_request.reconcile(&ctx.ctx));

        let (mount, ctx) = &mut self.mount;
        record(mount.reconcile(&ctx.ctx));

        let (mount_status, ctx) = &mut self.mount_status;
        record(mount_status.reconcile(&ctx.ctx));

        self.errors = errors;
    }

    /// Run passes until nothing is left to do.
    pub fn settle(&mut self) {
        for _ in 0..ROUNDS {
            self.step();
        }
    }

    /// Tear the lifecycle down and let every controller close its state.
    pub fn shutdown(&mut self) -> bool {
        lifecycle::begin_shutdown(&self.store).unwrap();
        self.settle();
        lifecycle::is_released(&self.store)
    }

    pub fn status(&self, id: &str) -> VolumeStatusSpec {
        self.store
            .get::<VolumeStatusSpec>(id)
            .unwrap_or_else(|| panic!("no status for volume {}", id))
            .spec
    }

    pub fn phase(&self, id: &str) -> VolumePhase {
        self.status(id).phase
    }
}

/// Index of the first log entry equal to `entry`.
pub fn position(log: &[String], entry: &str) -> usize {
    log.iter()
        .position(|line| line == entry)
        .unwrap_or_else(|| panic!("{:?} not in {:#?}", entry, log))
}
