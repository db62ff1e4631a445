// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;

use serde::Serialize;
use storage_expr::Expression;

use crate::encryption::EncryptionSpec;
use crate::resource_spec;

/// How a volume is backed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeType {
    #[default]
    Partition,
    Disk,
    Tmpfs,
    Directory,
    Symlink,
    Overlay,
    External,
}

impl VolumeType {
    /// Types that never touch a block device.
    pub fn is_trivial(self) -> bool {
        matches!(
            self,
            VolumeType::Tmpfs
                | VolumeType::Directory
                | VolumeType::Symlink
                | VolumeType::Overlay
                | VolumeType::External
        )
    }

    /// Types whose phase transitions are not worth logging.
    pub fn is_quiet(self) -> bool {
        matches!(
            self,
            VolumeType::Directory | VolumeType::Symlink | VolumeType::Overlay
        )
    }
}

impl fmt::Display for VolumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VolumeType::Partition => "partition",
            VolumeType::Disk => "disk",
            VolumeType::Tmpfs => "tmpfs",
            VolumeType::Directory => "directory",
            VolumeType::Symlink => "symlink",
            VolumeType::Overlay => "overlay",
            VolumeType::External => "external",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemType {
    #[default]
    None,
    Xfs,
    Ext4,
    Vfat,
    Swap,
}

impl FilesystemType {
    pub fn as_str(self) -> &'static str {
        match self {
            FilesystemType::None => "none",
            FilesystemType::Xfs => "xfs",
            FilesystemType::Ext4 => "ext4",
            FilesystemType::Vfat => "vfat",
            FilesystemType::Swap => "swap",
        }
    }

    /// Map a probed superblock name to a filesystem type.
    pub fn from_probe(name: &str) -> Option<Self> {
        match name {
            "xfs" => Some(FilesystemType::Xfs),
            "ext4" | "ext3" | "ext2" => Some(FilesystemType::Ext4),
            "vfat" => Some(FilesystemType::Vfat),
            "swap" => Some(FilesystemType::Swap),
            _ => None,
        }
    }
}

impl fmt::Display for FilesystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FilesystemType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "none" => Ok(FilesystemType::None),
            "xfs" => Ok(FilesystemType::Xfs),
            "ext4" => Ok(FilesystemType::Ext4),
            "vfat" => Ok(FilesystemType::Vfat),
            "swap" => Ok(FilesystemType::Swap),
            other => Err(format!("unsupported filesystem type {:?}", other)),
        }
    }
}

/// Which disks a volume may be provisioned on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiskSelector {
    #[serde(rename = "match")]
    pub match_expr: Expression,
    /// Device path of an externally managed volume.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub external: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartitionSpec {
    pub min_size: u64,
    /// Zero means unbounded.
    pub max_size: u64,
    /// Cap on the size as a percentage of the disk size; zero disables it.
    pub relative_max_size: u64,
    pub grow: bool,
    pub label: String,
    pub type_uuid: String,
}

impl PartitionSpec {
    /// Effective maximum size on a disk of `disk_size` bytes; zero means unbounded.
    pub fn resolved_max_size(&self, disk_size: u64) -> u64 {
        if self.relative_max_size == 0 {
            return self.max_size;
        }

        let relative = disk_size / 100 * self.relative_max_size;
        match self.max_size {
            0 => relative,
            max => max.min(relative),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilesystemSpec {
    #[serde(rename = "type")]
    pub filesystem_type: FilesystemType,
    pub label: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProvisioningSpec {
    pub wave: i32,
    pub disk_selector: DiskSelector,
    pub partition_spec: PartitionSpec,
    pub filesystem_spec: FilesystemSpec,
}

impl ProvisioningSpec {
    /// A zero spec means the volume is only ever located, never created.
    pub fn is_zero(&self) -> bool {
        *self == ProvisioningSpec::default()
    }
}

/// How an existing volume is found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LocatorSpec {
    #[default]
    None,
    /// Over `volume`, `disk` and `system_disk`.
    Match(Expression),
    /// Over `disk` and `system_disk`; disk volumes only.
    DiskMatch(Expression),
}

impl LocatorSpec {
    pub fn is_zero(&self) -> bool {
        match self {
            LocatorSpec::None => true,
            LocatorSpec::Match(expr) | LocatorSpec::DiskMatch(expr) => expr.is_zero(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MountSpec {
    pub target_path: String,
    /// Id of the volume this one is mounted beneath.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub parent_id: String,
    pub selinux_label: String,
    pub project_quota_support: bool,
    pub file_mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub recursive_relabel: bool,
    /// Bind-mount the source rather than mounting a filesystem.
    pub bind_target: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SymlinkProvisioningSpec {
    pub symlink_target_path: String,
    pub force: bool,
}

/// Desired state of one logical volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VolumeConfigSpec {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub parent_id: String,
    #[serde(rename = "type")]
    pub volume_type: VolumeType,
    pub provisioning: ProvisioningSpec,
    pub locator: LocatorSpec,
    pub mount: MountSpec,
    pub encryption: EncryptionSpec,
    pub symlink: SymlinkProvisioningSpec,
}

resource_spec!(VolumeConfigSpec, "VolumeConfigs.block");

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumePhase {
    #[default]
    Waiting,
    Missing,
    Located,
    Provisioned,
    Prepared,
    Ready,
    Closed,
    Failed,
}

impl fmt::Display for VolumePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VolumePhase::Waiting => "waiting",
            VolumePhase::Missing => "missing",
            VolumePhase::Located => "located",
            VolumePhase::Provisioned => "provisioned",
            VolumePhase::Prepared => "prepared",
            VolumePhase::Ready => "ready",
            VolumePhase::Closed => "closed",
            VolumePhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Observed state of one logical volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VolumeStatusSpec {
    pub phase: VolumePhase,
    pub pre_fail_phase: VolumePhase,
    #[serde(rename = "type")]
    pub volume_type: VolumeType,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub parent_id: String,

    /// Raw device the volume lives on.
    pub location: String,
    /// Device to mount; differs from `location` when encrypted.
    pub mount_location: String,
    pub parent_location: String,
    pub partition_index: u32,

    pub uuid: String,
    pub partition_uuid: String,
    pub size: u64,
    pub filesystem: FilesystemType,

    pub encryption_provider: String,
    /// Key slots that could not be brought in line with the configuration.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub encryption_failed_syncs: Vec<String>,

    pub mount_spec: MountSpec,
    pub symlink_spec: SymlinkProvisioningSpec,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

resource_spec!(VolumeStatusSpec, "VolumeStatuses.block");

/// Present in `Running` while the engine operates; tearing it down closes every volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VolumeLifecycleSpec {}

impl VolumeLifecycleSpec {
    pub const ID: &'static str = "lifecycle";
}

resource_spec!(VolumeLifecycleSpec, "VolumeLifecycles.block");

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UserDiskConfigStatusSpec {
    pub ready: bool,
    pub torn_down: bool,
}

impl UserDiskConfigStatusSpec {
    pub const ID: &'static str = "user-disks";
}

resource_spec!(UserDiskConfigStatusSpec, "UserDiskConfigStatuses.block");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{GIB, MIB};

    #[test]
    fn relative_max_size_caps_absolute_max() {
        let spec = PartitionSpec {
            max_size: 10 * GIB,
            relative_max_size: 50,
            ..Default::default()
        };
        assert_eq!(spec.resolved_max_size(8 * GIB), 8 * GIB / 100 * 50);
        assert_eq!(spec.resolved_max_size(100 * GIB), 10 * GIB);

        let unbounded = PartitionSpec {
            min_size: 100 * MIB,
            ..Default::default()
        };
        assert_eq!(unbounded.resolved_max_size(8 * GIB), 0);
    }

    #[test]
    fn zero_provisioning_is_detected() {
        assert!(ProvisioningSpec::default().is_zero());
        let spec = ProvisioningSpec {
            wave: -1,
            ..Default::default()
        };
        assert!(!spec.is_zero());
    }

    #[test]
    fn trivial_types() {
        assert!(VolumeType::Tmpfs.is_trivial());
        assert!(VolumeType::External.is_trivial());
        assert!(!VolumeType::Partition.is_trivial());
        assert!(VolumeType::Overlay.is_quiet());
        assert!(!VolumeType::Tmpfs.is_quiet());
    }
}
