// SPDX-License-Identifier: GPL-3.0-only

use crate::VolumeResult;

/// Superblock information of a single block device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResult {
    /// `xfs`, `ext4`, `luks`, `vfat`, `swap`, `gpt`, ... or empty when blank.
    pub name: String,
    pub uuid: String,
    pub label: String,
    pub size: u64,
    pub block_size: u64,
    pub probed_size: u64,
}

impl ProbeResult {
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

pub trait DeviceProber: Send + Sync {
    /// Probe `dev_path` while holding a shared lock on it.
    fn probe(&self, dev_path: &str) -> VolumeResult<ProbeResult>;
}

/// One GPT entry together with whatever was found inside it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbedPartition {
    pub number: u32,
    pub dev_path: String,
    pub partition_uuid: String,
    pub partition_type: String,
    pub partition_label: String,
    pub offset: u64,
    pub size: u64,
    pub content: ProbeResult,
}

/// Probe of a whole device and its partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceProbe {
    pub size: u64,
    pub sector_size: u64,
    pub io_size: u64,
    pub content: ProbeResult,
    pub partitions: Vec<ProbedPartition>,
}

/// Full probe of a device node, partitions included.
///
/// A device locked by someone else yields a retryable error; the caller
/// probes it again on the next pass.
pub trait DeviceScanner: Send + Sync {
    fn scan(&self, dev_path: &str) -> VolumeResult<DeviceProbe>;
}
