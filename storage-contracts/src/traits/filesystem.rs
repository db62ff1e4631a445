// SPDX-License-Identifier: GPL-3.0-only

use storage_types::FilesystemType;

use crate::VolumeResult;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatOptions {
    pub filesystem: FilesystemType,
    pub label: String,
    /// Enable project quota accounting (xfs).
    pub project_quota: bool,
    /// Discard blocks before formatting.
    pub discard: bool,
}

pub trait FilesystemMaker: Send + Sync {
    fn format(&self, dev_path: &str, options: &FormatOptions) -> VolumeResult<()>;

    /// Grow the filesystem on `dev_path` to fill its device.
    fn grow(&self, dev_path: &str, filesystem: FilesystemType) -> VolumeResult<()>;
}
