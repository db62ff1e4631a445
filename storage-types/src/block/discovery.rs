// SPDX-License-Identifier: GPL-3.0-only

use serde::Serialize;
use storage_expr::{ObjectBuilder, Value};

use crate::resource_spec;

/// Result of probing one device: the disk itself or one of its partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveredVolumeSpec {
    /// Device node, e.g. `/dev/sda2`.
    pub dev_path: String,
    /// Id of the parent device (empty for whole disks).
    pub parent: String,
    pub parent_dev_path: String,
    pub device_type: String,

    pub size: u64,
    pub sector_size: u64,
    pub io_size: u64,

    /// Detected content: `xfs`, `ext4`, `luks`, `vfat`, `swap`, `gpt`, ... or empty.
    pub name: String,
    pub uuid: String,
    pub label: String,
    pub block_size: u64,
    pub filesystem_block_size: u64,
    pub probed_size: u64,

    pub partition_uuid: String,
    pub partition_type: String,
    pub partition_label: String,
    pub partition_index: u32,
    /// Byte offset of the partition on its parent.
    pub offset: u64,
}

impl DiscoveredVolumeSpec {
    /// Value bound to `volume` in locator expressions.
    pub fn expr_value(&self) -> Value {
        ObjectBuilder::new()
            .field("dev_path", self.dev_path.as_str())
            .field("parent", self.parent.as_str())
            .field("parent_dev_path", self.parent_dev_path.as_str())
            .field("type", self.device_type.as_str())
            .field("size", self.size)
            .field("sector_size", self.sector_size)
            .field("io_size", self.io_size)
            .field("name", self.name.as_str())
            .field("uuid", self.uuid.as_str())
            .field("label", self.label.as_str())
            .field("block_size", self.block_size)
            .field("filesystem_block_size", self.filesystem_block_size)
            .field("probed_size", self.probed_size)
            .field("partition_uuid", self.partition_uuid.as_str())
            .field("partition_type", self.partition_type.as_str())
            .field("partition_label", self.partition_label.as_str())
            .field("partition_index", self.partition_index)
            .field("offset", self.offset)
            .build()
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

resource_spec!(DiscoveredVolumeSpec, "DiscoveredVolumes.block");

/// Bumped to force a full re-probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryRefreshRequestSpec {
    pub request: i64,
}

impl DiscoveryRefreshRequestSpec {
    pub const ID: &'static str = "refresh";
}

resource_spec!(DiscoveryRefreshRequestSpec, "DiscoveryRefreshRequests.block");

/// Echoes the request number once the matching probe batch completed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryRefreshStatusSpec {
    pub request: i64,
}

impl DiscoveryRefreshStatusSpec {
    pub const ID: &'static str = "refresh";
}

resource_spec!(DiscoveryRefreshStatusSpec, "DiscoveryRefreshStatuses.block");
