// SPDX-License-Identifier: GPL-3.0-only

use storage_contracts::VolumeError;
use storage_sys::SysError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    Sys(#[from] SysError),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error("disk {0} is not empty")]
    NotEmpty(String),

    #[error("disk {disk} is in use: {device} is mounted at {mount_point}")]
    Mounted {
        disk: String,
        device: String,
        mount_point: String,
    },

    #[error("disk {0} is read-only")]
    ReadOnly(String),

    #[error("disk {0} has no GPT partition table")]
    NoPartitionTable(String),

    #[error("disk {disk} has no {label} partition")]
    MissingPartition { disk: String, label: String },

    #[error("invalid META value {value:?}: {reason}")]
    MetaValue { value: String, reason: String },

    #[error("invalid manifest: {0}")]
    Manifest(String),

    #[error("failed to parse legacy manifest: {0}")]
    LegacyManifest(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, InstallError>;
