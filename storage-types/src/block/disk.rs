// SPDX-License-Identifier: GPL-3.0-only

use serde::Serialize;
use storage_expr::{ObjectBuilder, Value};

use crate::resource_spec;

/// Enriched view of a whole disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiskSpec {
    pub dev_path: String,
    pub size: u64,
    pub io_size: u64,
    pub sector_size: u64,
    pub readonly: bool,
    pub cdrom: bool,
    pub rotational: bool,
    /// `nvme`, `usb`, `virtio`, `sata`, `scsi`, `mmc` or empty.
    pub transport: String,
    pub wwid: String,
    pub model: String,
    pub serial: String,
    pub modalias: String,
    /// Bus path, e.g. `/pci0000:00/0000:00:1f.2/ata1/host0/...`.
    pub bus_path: String,
    pub sub_system: String,
    /// `/dev/disk/by-*` links pointing at this disk.
    pub symlinks: Vec<String>,
    pub secondary_disks: Vec<String>,
}

impl DiskSpec {
    /// Value bound to `disk` in locator and selector expressions.
    pub fn expr_value(&self) -> Value {
        ObjectBuilder::new()
            .field("dev_path", self.dev_path.as_str())
            .field("size", self.size)
            .field("io_size", self.io_size)
            .field("sector_size", self.sector_size)
            .field("readonly", self.readonly)
            .field("cdrom", self.cdrom)
            .field("rotational", self.rotational)
            .field("transport", self.transport.as_str())
            .field("wwid", self.wwid.as_str())
            .field("model", self.model.as_str())
            .field("serial", self.serial.as_str())
            .field("modalias", self.modalias.as_str())
            .field("bus_path", self.bus_path.as_str())
            .field("sub_system", self.sub_system.as_str())
            .field("symlinks", self.symlinks.clone())
            .field("secondary_disks", self.secondary_disks.clone())
            .build()
    }
}

resource_spec!(DiskSpec, "Disks.block");

/// Points at the disk carrying the META partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SystemDiskSpec {
    pub disk_id: String,
    pub dev_path: String,
}

impl SystemDiskSpec {
    pub const ID: &'static str = "system-disk";
}

resource_spec!(SystemDiskSpec, "SystemDisks.block");

/// Stable `/dev/disk/by-*` names of one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SymlinkSpec {
    pub paths: Vec<String>,
}

resource_spec!(SymlinkSpec, "Symlinks.block");
