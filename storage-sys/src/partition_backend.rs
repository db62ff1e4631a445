// SPDX-License-Identifier: GPL-3.0-only

//! [`PartitionTableBackend`] over the in-place GPT editor.

use storage_contracts::{
    Allocation, DiskCheck, DiskLock, PartitionRequest, PartitionTableBackend, RejectReason, VolumeError,
    VolumeResult,
};
use storage_types::VolumeType;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::blockdev::BlockDevice;
use crate::gpt::{GPT_RESERVED_SECTORS, Gpt, MIN_GROWTH};
use crate::probe::{partition_dev_path, probe_open_device};
use crate::wipe::{FAST_WIPE_RANGE, wipe_range};

#[derive(Debug, Clone, Copy, Default)]
pub struct GptBackend;

impl GptBackend {
    pub fn new() -> Self {
        Self
    }
}

/// Tell the kernel about a new partition, falling back to a full re-read.
fn inform_added(dev: &BlockDevice, number: u32, offset: u64, size: u64) {
    if let Err(err) = dev.inform_add(number, offset, size) {
        debug!("BLKPG add of {} partition {} failed: {}, re-reading table", dev.path(), number, err);
        if let Err(err) = dev.reread_partitions() {
            warn!("re-reading partition table of {}: {}", dev.path(), err);
        }
    }
}

/// Zero the head and tail of a freshly allocated partition so stale
/// superblocks from an earlier layout do not show through.
fn wipe_region(dev: &BlockDevice, offset: u64, size: u64) -> crate::Result<()> {
    let head = size.min(FAST_WIPE_RANGE);
    wipe_range(dev, offset, head)?;
    if size > 2 * FAST_WIPE_RANGE {
        wipe_range(dev, offset + size - FAST_WIPE_RANGE, FAST_WIPE_RANGE)?;
    }
    dev.sync()
}

impl PartitionTableBackend for GptBackend {
    fn lock_disk(&self, disk_path: &str) -> VolumeResult<DiskLock> {
        let dev = BlockDevice::open_exclusive(disk_path)?;
        debug!("locked {}", disk_path);
        Ok(DiskLock::new(dev))
    }

    fn check_disk(
        &self,
        disk_path: &str,
        volume_type: VolumeType,
        min_size: u64,
    ) -> VolumeResult<DiskCheck> {
        let dev = BlockDevice::open_shared(disk_path)?;
        let probe = probe_open_device(&dev)?;

        if volume_type == VolumeType::Disk {
            return Ok(if probe.content.is_empty() {
                DiskCheck::Fits
            } else {
                DiskCheck::Rejected(RejectReason::WrongFormat)
            });
        }

        if probe.content.is_empty() {
            let overhead = GPT_RESERVED_SECTORS * probe.sector_size;
            return Ok(if probe.size >= min_size.saturating_add(overhead) {
                DiskCheck::Fits
            } else {
                DiskCheck::Rejected(RejectReason::NotEnoughSpace)
            });
        }

        if probe.content.name != "gpt" {
            return Ok(DiskCheck::Rejected(RejectReason::WrongFormat));
        }

        let Some(table) = Gpt::read(&dev)? else {
            return Ok(DiskCheck::Rejected(RejectReason::GeneralError));
        };

        Ok(if table.largest_contiguous_allocatable() >= min_size {
            DiskCheck::Fits
        } else {
            DiskCheck::Rejected(RejectReason::NotEnoughSpace)
        })
    }

    fn allocate(&self, disk_path: &str, request: &PartitionRequest) -> VolumeResult<Allocation> {
        let type_guid = Uuid::parse_str(&request.type_uuid).map_err(|err| {
            VolumeError::config(format!("invalid partition type {:?}: {}", request.type_uuid, err))
        })?;

        let dev = BlockDevice::open_exclusive(disk_path)?;
        let sector_size = dev.sector_size();

        let mut table = match Gpt::read(&dev)? {
            Some(table) => table,
            None => {
                info!("creating GPT on {}", disk_path);
                Gpt::new(dev.size()?, sector_size)?
            }
        };

        let largest = table.largest_contiguous_allocatable();
        if largest < request.min_size {
            return Err(VolumeError::retryable(format!(
                "not enough space on {}: need {}, largest free extent is {}",
                disk_path, request.min_size, largest
            )));
        }

        let size = if request.max_size == 0 {
            0
        } else {
            request.max_size.min(largest)
        };

        let number = table.allocate(size, &request.label, type_guid)?;
        table.write(&dev)?;

        let partition = table
            .partition(number)
            .ok_or_else(|| VolumeError::system(format!("partition {} vanished after allocation", number)))?
            .clone();
        let offset = partition.offset(sector_size);
        let part_size = partition.size(sector_size);

        inform_added(&dev, number, offset, part_size);
        wipe_region(&dev, offset, part_size)?;

        let dev_path = partition_dev_path(disk_path, number);
        info!(
            "allocated partition {} ({} bytes, label {:?}) on {}",
            dev_path, part_size, request.label, disk_path
        );

        Ok(Allocation {
            partition_index: number,
            dev_path,
            partition_uuid: partition.uuid_string(),
            size: part_size,
        })
    }

    fn grow(
        &self,
        disk_path: &str,
        partition_index: u32,
        max_size: u64,
    ) -> VolumeResult<Option<u64>> {
        let dev = BlockDevice::open_exclusive(disk_path)?;
        let sector_size = dev.sector_size();

        let Some(mut table) = Gpt::read(&dev)? else {
            return Err(VolumeError::system(format!("{} has no partition table", disk_path)));
        };

        let current = table
            .partition(partition_index)
            .map(|p| p.size(sector_size))
            .ok_or_else(|| {
                VolumeError::system(format!("partition {} not found on {}", partition_index, disk_path))
            })?;

        let mut grow_by = table.available_partition_growth(partition_index)?;
        if max_size > 0 {
            grow_by = grow_by.min(max_size.saturating_sub(current));
        }
        grow_by -= grow_by % sector_size;

        if grow_by <= MIN_GROWTH {
            debug!(
                "partition {} on {} has {} bytes to grow into, skipping",
                partition_index, disk_path, grow_by
            );
            return Ok(None);
        }

        table.grow_partition(partition_index, grow_by)?;
        table.write(&dev)?;

        let Some(partition) = table.partition(partition_index) else {
            return Err(VolumeError::system(format!("partition {} vanished after grow", partition_index)));
        };
        let offset = partition.offset(sector_size);
        let new_size = partition.size(sector_size);

        if let Err(err) = dev.inform_resize(partition_index, offset, new_size) {
            warn!("BLKPG resize of {} partition {}: {}", disk_path, partition_index, err);
        }

        info!(
            "grew partition {} on {} from {} to {} bytes",
            partition_index, disk_path, current, new_size
        );
        Ok(Some(new_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::os::unix::fs::FileExt;
    use storage_types::{GIB, MIB};

    const LINUX_DATA: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";

    fn sparse_disk(dir: &tempfile::TempDir, size: u64) -> String {
        let path = dir.path().join("disk.img");
        let file = File::create(&path).unwrap();
        file.set_len(size).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn request(label: &str, min_size: u64, max_size: u64) -> PartitionRequest {
        PartitionRequest {
            min_size,
            max_size,
            label: label.to_string(),
            type_uuid: LINUX_DATA.to_string(),
        }
    }

    #[test]
    fn disk_lock_keeps_probes_out_until_dropped() {
        use std::time::Duration;

        use crate::blockdev::LockMode;
        use crate::SysError;

        let dir = tempfile::tempdir().unwrap();
        let disk = sparse_disk(&dir, 64 * MIB);
        let backend = GptBackend::new();

        let lock = backend.lock_disk(&disk).unwrap();
        let err = BlockDevice::open(&disk, false, LockMode::Shared, Duration::from_millis(250))
            .unwrap_err();
        assert!(matches!(err, SysError::LockTimeout(_)), "{}", err);

        drop(lock);
        BlockDevice::open(&disk, false, LockMode::Shared, Duration::from_millis(250)).unwrap();
    }

    #[test]
    fn empty_disk_fits_partitions_and_whole_disk_volumes() {
        let dir = tempfile::tempdir().unwrap();
        let disk = sparse_disk(&dir, 64 * MIB);
        let backend = GptBackend::new();

        assert_eq!(backend.check_disk(&disk, VolumeType::Disk, 0).unwrap(), DiskCheck::Fits);
        assert_eq!(
            backend.check_disk(&disk, VolumeType::Partition, 32 * MIB).unwrap(),
            DiskCheck::Fits
        );
        assert_eq!(
            backend.check_disk(&disk, VolumeType::Partition, 64 * MIB).unwrap(),
            DiskCheck::Rejected(RejectReason::NotEnoughSpace)
        );
    }

    #[test]
    fn allocates_sequentially_and_rechecks_free_space() {
        let dir = tempfile::tempdir().unwrap();
        let disk = sparse_disk(&dir, 256 * MIB);
        let backend = GptBackend::new();

        let meta = backend.allocate(&disk, &request("META", MIB, MIB)).unwrap();
        assert_eq!(meta.partition_index, 1);
        assert_eq!(meta.size, MIB);
        assert!(meta.dev_path.ends_with("disk.img1"));

        let state = backend.allocate(&disk, &request("STATE", 100 * MIB, 100 * MIB)).unwrap();
        assert_eq!(state.partition_index, 2);
        assert_eq!(state.size, 100 * MIB);
        assert_ne!(meta.partition_uuid, state.partition_uuid);

        assert_eq!(backend.check_disk(&disk, VolumeType::Disk, 0).unwrap(),
            DiskCheck::Rejected(RejectReason::WrongFormat));
        assert_eq!(
            backend.check_disk(&disk, VolumeType::Partition, GIB).unwrap(),
            DiskCheck::Rejected(RejectReason::NotEnoughSpace)
        );

        let rest = backend.allocate(&disk, &request("EPHEMERAL", 100 * MIB, 0)).unwrap();
        assert_eq!(rest.partition_index, 3);
        assert!(rest.size >= 100 * MIB);

        let err = backend.allocate(&disk, &request("EXTRA", 10 * MIB, 0)).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn foreign_content_is_the_wrong_format() {
        let dir = tempfile::tempdir().unwrap();
        let disk = sparse_disk(&dir, 64 * MIB);
        // xfs superblock magic
        File::options().write(true).open(&disk).unwrap().write_all_at(b"XFSB", 0).unwrap();

        assert_eq!(
            GptBackend::new().check_disk(&disk, VolumeType::Partition, MIB).unwrap(),
            DiskCheck::Rejected(RejectReason::WrongFormat)
        );
    }

    #[test]
    fn grows_last_partition_after_disk_grows() {
        let dir = tempfile::tempdir().unwrap();
        let disk = sparse_disk(&dir, 128 * MIB);
        let backend = GptBackend::new();

        let part = backend.allocate(&disk, &request("EPHEMERAL", 64 * MIB, 0)).unwrap();
        assert_eq!(backend.grow(&disk, part.partition_index, 0).unwrap(), None);

        File::options().write(true).open(&disk).unwrap().set_len(256 * MIB).unwrap();

        let grown = backend.grow(&disk, part.partition_index, 0).unwrap().unwrap();
        assert!(grown >= part.size + 127 * MIB);

        assert_eq!(backend.grow(&disk, part.partition_index, 0).unwrap(), None);
    }

    #[test]
    fn grow_respects_max_size() {
        let dir = tempfile::tempdir().unwrap();
        let disk = sparse_disk(&dir, 256 * MIB);
        let backend = GptBackend::new();

        let part = backend.allocate(&disk, &request("DATA", 32 * MIB, 32 * MIB)).unwrap();
        let grown = backend.grow(&disk, part.partition_index, 64 * MIB).unwrap();
        assert_eq!(grown, Some(64 * MIB));
        assert_eq!(backend.grow(&disk, part.partition_index, 64 * MIB).unwrap(), None);
    }
}
