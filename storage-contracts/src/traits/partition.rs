// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;

use storage_types::VolumeType;

use crate::VolumeResult;

/// Why a disk cannot host a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NotEnoughSpace,
    WrongFormat,
    GeneralError,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NotEnoughSpace => write!(f, "not enough space"),
            RejectReason::WrongFormat => write!(f, "wrong format"),
            RejectReason::GeneralError => write!(f, "general error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskCheck {
    Fits,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRequest {
    pub min_size: u64,
    /// Zero means all contiguous free space.
    pub max_size: u64,
    pub label: String,
    pub type_uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// 1-based partition number.
    pub partition_index: u32,
    pub dev_path: String,
    pub partition_uuid: String,
    pub size: u64,
}

/// Exclusive hold on a whole disk, released on drop.
///
/// Probes of the disk wait while it is held, so nobody reads a header that
/// is only half written.
#[must_use = "the disk is unlocked as soon as the guard drops"]
pub struct DiskLock {
    _guard: Box<dyn Send>,
}

impl DiskLock {
    pub fn new<G: Send + 'static>(guard: G) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

impl fmt::Debug for DiskLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskLock").finish_non_exhaustive()
    }
}

pub trait PartitionTableBackend: Send + Sync {
    /// Take the exclusive lock on `disk_path`.
    fn lock_disk(&self, disk_path: &str) -> VolumeResult<DiskLock>;


    /// Decide whether a volume of `volume_type` needing `min_size` bytes fits on `disk_path`.
    fn check_disk(
        &self,
        disk_path: &str,
        volume_type: VolumeType,
        min_size: u64,
    ) -> VolumeResult<DiskCheck>;

    /// Allocate a partition (creating the table if needed) and wipe its first sectors.
    fn allocate(&self, disk_path: &str, request: &PartitionRequest) -> VolumeResult<Allocation>;

    /// Grow partition `partition_index` into the free space after it.
    ///
    /// Returns the new size, or `None` when there is nothing worth growing into.
    fn grow(
        &self,
        disk_path: &str,
        partition_index: u32,
        max_size: u64,
    ) -> VolumeResult<Option<u64>>;
}
