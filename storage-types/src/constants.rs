// SPDX-License-Identifier: GPL-3.0-only

//! Well-known volume ids, labels, paths and sizes.

use crate::common::{GIB, MIB};

pub const META_PARTITION_LABEL: &str = "META";
pub const STATE_PARTITION_LABEL: &str = "STATE";
pub const EPHEMERAL_PARTITION_LABEL: &str = "EPHEMERAL";

/// Filesystem name probed on the META partition by newer tooling.
pub const META_FILESYSTEM_NAME: &str = "talosmeta";

pub const META_SIZE: u64 = MIB;
pub const STATE_SIZE: u64 = 100 * MIB;
pub const EPHEMERAL_MIN_SIZE: u64 = 2 * GIB;
pub const MIN_USER_VOLUME_SIZE: u64 = 100 * MIB;

pub const STATE_MOUNT_POINT: &str = "/system/state";
pub const EPHEMERAL_MOUNT_POINT: &str = "/var";
pub const USER_VOLUME_MOUNT_POINT: &str = "/var/mnt";
pub const OVERLAY_ROOT: &str = "/system/overlays";

pub const USER_VOLUME_PREFIX: &str = "u-";
pub const RAW_VOLUME_PREFIX: &str = "r-";
pub const EXISTING_VOLUME_PREFIX: &str = "e-";
pub const SWAP_VOLUME_PREFIX: &str = "s-";

/// Wave of the system disk volumes (META, STATE, EPHEMERAL).
pub const WAVE_SYSTEM_DISK: i32 = -1;
/// Wave of user volumes.
pub const WAVE_USER_VOLUMES: i32 = 0;
/// Wave of volumes declared through the legacy per-disk configuration.
pub const WAVE_LEGACY_USER_DISKS: i32 = 1_000_000;

pub const LABEL_SYSTEM_VOLUME: &str = "system-volume";
pub const LABEL_USER_VOLUME: &str = "user-volume";
pub const LABEL_RAW_VOLUME: &str = "raw-volume";
pub const LABEL_EXISTING_VOLUME: &str = "existing-volume";
pub const LABEL_SWAP_VOLUME: &str = "swap-volume";
/// Links a fanned-out `VolumeMountStatus` to its `MountStatus`.
pub const LABEL_MOUNT_STATUS_ID: &str = "mount-status-id";

/// Mapped device name suffix of opened encrypted volumes.
pub const ENCRYPTED_MAPPER_SUFFIX: &str = "-encrypted";
pub const DEV_MAPPER: &str = "/dev/mapper";

/// META tag holding the persisted STATE encryption configuration.
pub const META_TAG_STATE_ENCRYPTION_CONFIG: u8 = 0x0d;
/// META tag recording that the disk went through an upgrade.
pub const META_TAG_UPGRADE: u8 = 0x06;

pub const DEFAULT_LUKS_CIPHER: &str = "aes-xts-plain64";
pub const DEFAULT_LUKS_KEY_SIZE: u32 = 512;
pub const DEFAULT_LUKS_BLOCK_SIZE: u64 = 4096;

/// Mapped name of an encrypted volume located at `location`.
pub fn encrypted_mapper_name(location: &str) -> String {
    let base = location.rsplit('/').next().unwrap_or(location);
    format!("{}{}", base, ENCRYPTED_MAPPER_SUFFIX)
}

/// `/dev/mapper/<base>-encrypted` for a volume at `location`.
pub fn encrypted_mapper_path(location: &str) -> String {
    format!("{}/{}", DEV_MAPPER, encrypted_mapper_name(location))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapper_names_use_the_device_basename() {
        assert_eq!(encrypted_mapper_name("/dev/sda2"), "sda2-encrypted");
        assert_eq!(encrypted_mapper_path("/dev/nvme0n1p3"), "/dev/mapper/nvme0n1p3-encrypted");
    }
}
