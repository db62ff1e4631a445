// SPDX-License-Identifier: GPL-3.0-only

use serde::Serialize;

use crate::resource_spec;

/// One kernel block device node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceSpec {
    /// `disk` or `partition`.
    pub device_type: String,
    pub major: u32,
    pub minor: u32,
    /// Path under `/sys`, e.g. `/sys/devices/pci0000:00/.../block/sda`.
    pub dev_path: String,
    pub dev_name: String,
    pub partition_name: String,
    pub partition_number: u32,
    /// Id of the parent disk (partitions only).
    pub parent: String,
    /// Ids of the devices this one is composed of (dm, md).
    pub secondaries: Vec<String>,
    /// Bumped on every uevent or close-after-write of `/dev/<name>`.
    pub generation: u64,
}

impl DeviceSpec {
    pub fn is_partition(&self) -> bool {
        self.device_type == "partition"
    }
}

resource_spec!(DeviceSpec, "Devices.block");

/// Written by the devices controller once the initial `/sys/block` walk is done.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceResyncSpec {
    pub done: bool,
}

impl DeviceResyncSpec {
    pub const ID: &'static str = "resync";
}

resource_spec!(DeviceResyncSpec, "DeviceResyncs.block");

/// Settled state of device discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DevicesStatusSpec {
    pub ready: bool,
}

impl DevicesStatusSpec {
    pub const ID: &'static str = "devices";
}

resource_spec!(DevicesStatusSpec, "DevicesStatuses.block");
