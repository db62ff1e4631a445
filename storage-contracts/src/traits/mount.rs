// SPDX-License-Identifier: GPL-3.0-only

use crate::VolumeResult;

/// Ownership, mode and SELinux label applied to a mount target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSettings {
    pub file_mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub selinux_label: String,
    pub recursive: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountPoint {
    pub source: String,
    pub target: String,
    pub filesystem: String,
    pub read_only: bool,
    pub noatime: bool,
    pub bind: bool,
    /// Comma-separated filesystem options (`prjquota`, `lowerdir=...`).
    pub data: String,
}

pub trait MountBackend: Send + Sync {
    fn mount(&self, point: &MountPoint) -> VolumeResult<()>;

    fn unmount(&self, target: &str) -> VolumeResult<()>;

    fn remount(&self, target: &str, read_only: bool) -> VolumeResult<()>;

    /// Create `path` (and parents) as a directory.
    fn ensure_directory(&self, path: &str) -> VolumeResult<()>;

    /// Point `link` at `target`; an existing entry is replaced only with `force`.
    fn ensure_symlink(&self, target: &str, link: &str, force: bool) -> VolumeResult<()>;

    fn apply_settings(&self, path: &str, settings: &TargetSettings) -> VolumeResult<()>;

    fn swap_on(&self, dev_path: &str) -> VolumeResult<()>;

    fn swap_off(&self, dev_path: &str) -> VolumeResult<()>;
}
