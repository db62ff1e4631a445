// SPDX-License-Identifier: GPL-3.0-only

//! The `/dev/disk/by-*` names of every disk and discovered volume.
//!
//! The names are only recorded; creating the links is left to udev.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Context;
use storage_runtime::{Controller, ControllerContext, Input, Output};
use storage_types::{DiscoveredVolumeSpec, DiskSpec, SymlinkSpec};
use tracing::debug;

const BY_ID: &str = "/dev/disk/by-id";
const BY_PATH: &str = "/dev/disk/by-path";
const BY_UUID: &str = "/dev/disk/by-uuid";
const BY_LABEL: &str = "/dev/disk/by-label";
const BY_PARTUUID: &str = "/dev/disk/by-partuuid";
const BY_PARTLABEL: &str = "/dev/disk/by-partlabel";

#[derive(Default)]
pub struct SymlinksController;

impl SymlinksController {
    pub const NAME: &'static str = "SymlinksController";

    pub fn new() -> Self {
        Self
    }

    pub fn reconcile(&mut self, ctx: &ControllerContext) -> anyhow::Result<()> {
        let disks: BTreeMap<String, DiskSpec> = ctx
            .list::<DiskSpec>()
            .into_iter()
            .map(|disk| (disk.id().to_string(), disk.spec))
            .collect();

        let mut links: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for (id, disk) in &disks {
            links.entry(id.clone()).or_default().extend(disk_links(disk, None));
        }

        for volume in ctx.list::<DiscoveredVolumeSpec>() {
            let entry = links.entry(volume.id().to_string()).or_default();
            entry.extend(volume_links(&volume.spec));

            if volume.spec.partition_index > 0
                && let Some(disk) = disks.get(&volume.spec.parent)
            {
                entry.extend(disk_links(disk, Some(volume.spec.partition_index)));
            }
        }

        for (id, paths) in &links {
            if paths.is_empty() {
                continue;
            }
            let paths: Vec<String> = paths.iter().cloned().collect();
            ctx.modify(id, SymlinkSpec::default, |links| links.spec.paths = paths)
                .with_context(|| format!("failed to write symlinks of {}", id))?;
        }

        for existing in ctx.list::<SymlinkSpec>() {
            if links.get(existing.id()).is_some_and(|paths| !paths.is_empty()) {
                continue;
            }
            match ctx.destroy::<SymlinkSpec>(existing.id()) {
                Ok(()) => debug!("symlinks of {} removed", existing.id()),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err).context("failed to remove symlinks"),
            }
        }

        Ok(())
    }
}

/// udev escapes everything outside a safe set in label links.
fn escape(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "#+-.:=@_".contains(c) {
                c.to_string()
            } else {
                format!("\\x{:02x}", c as u32)
            }
        })
        .collect()
}

fn underscored(value: &str) -> String {
    value.trim().replace(' ', "_")
}

fn id_prefix(transport: &str) -> &str {
    match transport {
        "sata" => "ata",
        "" => "scsi",
        other => other,
    }
}

/// The PCI function a bus path hangs off, followed by the port where known.
fn path_id(bus_path: &str) -> Option<String> {
    let components: Vec<&str> = bus_path.split('/').filter(|c| !c.is_empty()).collect();
    let pci = components.iter().rposition(|c| is_pci_address(c))?;

    let mut id = format!("pci-{}", components[pci]);
    if let Some(port) = components[pci + 1..]
        .iter()
        .find_map(|c| c.strip_prefix("ata"))
        .filter(|port| port.chars().all(|ch| ch.is_ascii_digit()))
    {
        id.push_str(&format!("-ata-{}", port));
    }
    Some(id)
}

/// `dddd:bb:ss.f`, as opposed to SCSI addresses like `0:0:0:0`.
fn is_pci_address(component: &str) -> bool {
    let Some((address, function)) = component.split_once('.') else {
        return false;
    };
    let parts: Vec<&str> = address.split(':').collect();
    let hex = |part: &str, len: usize| part.len() == len && part.chars().all(|c| c.is_ascii_hexdigit());

    parts.len() == 3
        && hex(parts[0], 4)
        && hex(parts[1], 2)
        && hex(parts[2], 2)
        && hex(function, 1)
}

fn disk_links(disk: &DiskSpec, partition: Option<u32>) -> Vec<String> {
    let suffix = partition.map(|n| format!("-part{}", n)).unwrap_or_default();
    let mut links = Vec::new();

    if let Some(wwn) = disk.wwid.strip_prefix("naa.") {
        links.push(format!("{}/wwn-0x{}{}", BY_ID, wwn.to_lowercase(), suffix));
    } else if disk.wwid.starts_with("eui.") {
        links.push(format!("{}/nvme-{}{}", BY_ID, disk.wwid, suffix));
    }

    if !disk.serial.is_empty() {
        let name = if disk.model.is_empty() {
            underscored(&disk.serial)
        } else {
            format!("{}_{}", underscored(&disk.model), underscored(&disk.serial))
        };
        links.push(format!("{}/{}-{}{}", BY_ID, id_prefix(&disk.transport), name, suffix));
    }

    if let Some(path) = path_id(&disk.bus_path) {
        links.push(format!("{}/{}{}", BY_PATH, path, suffix));
    }

    links
}

fn volume_links(volume: &DiscoveredVolumeSpec) -> Vec<String> {
    let mut links = Vec::new();

    if !volume.uuid.is_empty() {
        links.push(format!("{}/{}", BY_UUID, volume.uuid));
    }
    if !volume.label.is_empty() {
        links.push(format!("{}/{}", BY_LABEL, escape(&volume.label)));
    }
    if !volume.partition_uuid.is_empty() {
        links.push(format!("{}/{}", BY_PARTUUID, volume.partition_uuid.to_lowercase()));
    }
    if !volume.partition_label.is_empty() {
        links.push(format!("{}/{}", BY_PARTLABEL, escape(&volume.partition_label)));
    }

    links
}

impl Controller for SymlinksController {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::of::<DiskSpec>(), Input::of::<DiscoveredVolumeSpec>()]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<SymlinkSpec>()]
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
    use storage_runtime::Store;
    use storage_testing::TestContext;
    use storage_types::Resource;

    fn sata_disk() -> DiskSpec {
        DiskSpec {
            dev_path: "/dev/sda".to_string(),
            transport: "sata".to_string(),
            model: "QEMU HARDDISK".to_string(),
            serial: "QM00001".to_string(),
            wwid: "naa.5000C500A1B2C3D4".to_string(),
            bus_path: "/pci0000:00/0000:00:1f.2/ata1/host0/target0:0:0/0:0:0:0".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn pci_functions_are_told_apart_from_scsi_addresses() {
        assert!(is_pci_address("0000:00:1f.2"));
        assert!(is_pci_address("0000:3b:00.0"));
        assert!(!is_pci_address("0:0:0:0"));
        assert!(!is_pci_address("target0:0:0"));
        assert!(!is_pci_address("pci0000:00"));

        assert_eq!(
            path_id("/pci0000:00/0000:00:1f.2/ata1/host0/target0:0:0/0:0:0:0").as_deref(),
            Some("pci-0000:00:1f.2-ata-1")
        );
        // behind a bridge the last function is the controller
        assert_eq!(
            path_id("/pci0000:00/0000:00:01.0/0000:01:00.0/nvme/nvme0").as_deref(),
            Some("pci-0000:01:00.0")
        );
        assert_eq!(path_id("/platform/virtual/0:0:0:0"), None);
    }

    #[test]
    fn disk_and_partition_links() {
        let store = Store::new();
        let test = TestContext::new(&store, SymlinksController::NAME);

        store.create("DisksController", Resource::new("sda", sata_disk())).unwrap();
        store
            .create(
                "DiscoveryController",
                Resource::new(
                    "sda2",
                    DiscoveredVolumeSpec {
                        parent: "sda".to_string(),
                        uuid: "8f7a1c2e-0000-4000-8000-000000000001".to_string(),
                        label: "STATE".to_string(),
                        partition_uuid: "ABCD-EF".to_string(),
                        partition_label: "my data".to_string(),
                        partition_index: 2,
                        ..Default::default()
                    },
                ),
            )
            .unwrap();

        SymlinksController::new().reconcile(&test.ctx).unwrap();

        let disk = store.get::<SymlinkSpec>("sda").unwrap();
        assert_eq!(
            disk.spec.paths,
            [
                "/dev/disk/by-id/ata-QEMU_HARDDISK_QM00001",
                "/dev/disk/by-id/wwn-0x5000c500a1b2c3d4",
                "/dev/disk/by-path/pci-0000:00:1f.2-ata-1",
            ]
        );

        let part = store.get::<SymlinkSpec>("sda2").unwrap();
        assert!(part.spec.paths.contains(&"/dev/disk/by-id/ata-QEMU_HARDDISK_QM00001-part2".to_string()));
        assert!(part.spec.paths.contains(&"/dev/disk/by-label/STATE".to_string()));
        assert!(part.spec.paths.contains(&"/dev/disk/by-partuuid/abcd-ef".to_string()));
        assert!(part.spec.paths.contains(&"/dev/disk/by-partlabel/my\\x20data".to_string()));
        assert!(part.spec.paths.contains(&"/dev/disk/by-path/pci-0000:00:1f.2-ata-1-part2".to_string()));
    }

    #[test]
    fn links_of_removed_devices_are_dropped() {
        let store = Store::new();
        let test = TestContext::new(&store, SymlinksController::NAME);
        let mut controller = SymlinksController::new();

        store.create("DisksController", Resource::new("sda", sata_disk())).unwrap();
        controller.reconcile(&test.ctx).unwrap();
        assert!(store.get::<SymlinkSpec>("sda").is_some());

        store.destroy::<DiskSpec>("DisksController", "sda").unwrap();
        controller.reconcile(&test.ctx).unwrap();
        assert!(store.get::<SymlinkSpec>("sda").is_none());
    }

    #[test]
    fn pci_addresses_are_recognised() {
        assert!(is_pci_address("0000:00:1f.2"));
        assert!(!is_pci_address("pci0000:00"));
        assert_eq!(path_id("/pci0000:00/0000:00:04.0/virtio1/host0").as_deref(), Some("pci-0000:00:04.0"));
        assert_eq!(path_id("/virtual"), None);
    }
}
