// SPDX-License-Identifier: GPL-3.0-only

//! Whole disks with their sysfs attributes.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use anyhow::Context;
use storage_runtime::{Controller, ControllerContext, Input, Output};
use storage_sys::sysfs::{DiskProperties, Sysfs};
use storage_types::{DeviceSpec, DiskSpec, SymlinkSpec};
use tracing::debug;

pub struct DisksController {
    sysfs: Sysfs,
    dev_root: String,
    /// Attributes read at a device generation.
    cache: HashMap<String, (u64, DiskProperties)>,
}

impl DisksController {
    pub const NAME: &'static str = "DisksController";

    pub fn new(sysfs: Sysfs, dev_root: impl Into<String>) -> Self {
        Self {
            sysfs,
            dev_root: dev_root.into(),
            cache: HashMap::new(),
        }
    }

    fn properties(&mut self, device: &DeviceSpec, id: &str) -> &DiskProperties {
        let stale = self
            .cache
            .get(id)
            .is_none_or(|(generation, _)| *generation != device.generation);
        if stale {
            let props = self
                .sysfs
                .disk_properties(Path::new(&device.dev_path), device.major);
            self.cache.insert(id.to_string(), (device.generation, props));
        }

        &self.cache[id].1
    }

    pub fn reconcile(&mut self, ctx: &ControllerContext) -> anyhow::Result<()> {
        let mut kept = BTreeSet::new();

        for device in ctx.list::<DeviceSpec>() {
            if device.spec.device_type != "disk" {
                continue;
            }

            let id = device.id().to_string();
            let props = self.properties(&device.spec, &id).clone();
            if props.size == 0 {
                // empty loop devices, card readers without media
                continue;
            }

            let symlinks = ctx
                .get::<SymlinkSpec>(&id)
                .map(|links| links.spec.paths)
                .unwrap_or_default();
            let dev_path = format!("{}/{}", self.dev_root, id);
            let secondaries = device.spec.secondaries.clone();

            ctx.modify(&id, DiskSpec::default, |disk| {
                disk.spec = DiskSpec {
                    dev_path,
                    size: props.size,
                    io_size: props.io_size,
                    sector_size: props.sector_size,
                    readonly: props.readonly,
                    cdrom: props.cdrom,
                    rotational: props.rotational,
                    transport: props.transport,
                    wwid: props.wwid,
                    model: props.model,
                    serial: props.serial,
                    modalias: props.modalias,
                    bus_path: props.bus_path,
                    sub_system: props.sub_system,
                    symlinks,
                    secondary_disks: secondaries,
                };
            })
            .with_context(|| format!("failed to write disk {}", id))?;

            kept.insert(id);
        }

        self.cache.retain(|id, _| kept.contains(id));

        for disk in ctx.list::<DiskSpec>() {
            if kept.contains(disk.id()) {
                continue;
            }
            match ctx.destroy::<DiskSpec>(disk.id()) {
                Ok(()) => debug!("disk {} removed", disk.id()),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err).with_context(|| format!("failed to remove disk {}", disk.id())),
            }
        }

        Ok(())
    }
}

impl Controller for DisksController {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::of::<DeviceSpec>(), Input::of::<SymlinkSpec>()]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<DiskSpec>()]
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
    use std::fs;
    use storage_runtime::Store;
    use storage_testing::TestContext;
    use storage_types::Resource;

    const SDA: &str = "devices/pci0000:00/0000:00:1f.2/ata1/host0/target0:0:0/0:0:0:0/block/sda";
    const LOOP0: &str = "devices/virtual/block/loop0";

    fn fake_sysfs() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        let sda = root.path().join(SDA);
        fs::create_dir_all(sda.join("queue")).unwrap();
        fs::create_dir_all(sda.join("device")).unwrap();
        fs::create_dir_all(root.path().join(LOOP0)).unwrap();

        fs::write(sda.join("size"), "16777216\n").unwrap();
        fs::write(sda.join("ro"), "0\n").unwrap();
        fs::write(sda.join("queue/logical_block_size"), "512\n").unwrap();
        fs::write(sda.join("queue/minimum_io_size"), "4096\n").unwrap();
        fs::write(sda.join("queue/rotational"), "1\n").unwrap();
        fs::write(sda.join("device/model"), "QEMU HARDDISK\n").unwrap();
        fs::write(sda.join("device/serial"), "QM00001\n").unwrap();
        fs::write(root.path().join(LOOP0).join("size"), "0\n").unwrap();
        root
    }

    fn device(store: &Store, root: &Path, id: &str, rel: &str, device_type: &str) {
        let spec = DeviceSpec {
            device_type: device_type.to_string(),
            major: 8,
            dev_path: root.join(rel).display().to_string(),
            dev_name: id.to_string(),
            generation: 1,
            ..Default::default()
        };
        store
            .create("DevicesController", Resource::new(id, spec))
            .unwrap();
    }

    #[test]
    fn disks_carry_sysfs_attributes_and_symlinks() {
        let root = fake_sysfs();
        let store = Store::new();
        let test = TestContext::new(&store, DisksController::NAME);
        let mut controller = DisksController::new(Sysfs::new(root.path()), "/dev");

        device(&store, root.path(), "sda", SDA, "disk");
        device(&store, root.path(), "sda1", &format!("{}/sda1", SDA), "partition");
        device(&store, root.path(), "loop0", LOOP0, "disk");
        store
            .create(
                "SymlinksController",
                Resource::new(
                    "sda",
                    SymlinkSpec {
                        paths: vec!["/dev/disk/by-id/ata-QEMU_HARDDISK_QM00001".to_string()],
                    },
                ),
            )
            .unwrap();

        controller.reconcile(&test.ctx).unwrap();

        let disk = store.get::<DiskSpec>("sda").unwrap();
        assert_eq!(disk.spec.dev_path, "/dev/sda");
        assert_eq!(disk.spec.size, 8 * storage_types::GIB);
        assert_eq!(disk.spec.io_size, 4096);
        assert!(disk.spec.rotational);
        assert_eq!(disk.spec.model, "QEMU HARDDISK");
        assert_eq!(disk.spec.serial, "QM00001");
        assert_eq!(disk.spec.transport, "sata");
        assert_eq!(disk.spec.symlinks, ["/dev/disk/by-id/ata-QEMU_HARDDISK_QM00001"]);

        assert!(store.get::<DiskSpec>("sda1").is_none());
        assert!(store.get::<DiskSpec>("loop0").is_none());
    }

    #[test]
    fn vanished_devices_drop_their_disk() {
        let root = fake_sysfs();
        let store = Store::new();
        let test = TestContext::new(&store, DisksController::NAME);
        let mut controller = DisksController::new(Sysfs::new(root.path()), "/dev");

        device(&store, root.path(), "sda", SDA, "disk");
        controller.reconcile(&test.ctx).unwrap();
        assert!(store.get::<DiskSpec>("sda").is_some());

        store.destroy::<DeviceSpec>("DevicesController", "sda").unwrap();
        controller.reconcile(&test.ctx).unwrap();
        assert!(store.get::<DiskSpec>("sda").is_none());
    }
}
