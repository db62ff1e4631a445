// SPDX-License-Identifier: GPL-3.0-only

//! Checks run before anything is written to the disk.

use std::fs;
use std::path::Path;

use storage_contracts::DeviceProbe;
use storage_sys::BlockDevice;
use storage_sys::mount::read_mountinfo;
use storage_sys::probe::probe_open_device;
use tracing::debug;

use crate::{InstallError, Result};

/// What the preflight found on the disk.
#[derive(Debug, Clone)]
pub struct DiskState {
    pub probe: DeviceProbe,
}

impl DiskState {
    /// Blank, or a partition table without partitions.
    pub fn is_empty(&self) -> bool {
        self.probe.content.is_empty()
            || (self.probe.content.name == "gpt" && self.probe.partitions.is_empty())
    }
}

/// The disk exists, nothing on it is mounted and it is writable.
pub fn check(disk: &str) -> Result<DiskState> {
    let dev = BlockDevice::open_shared(disk)?;
    let probe = probe_open_device(&dev)?;

    check_not_mounted(disk, &probe)?;

    if is_read_only(&dev)? {
        return Err(InstallError::ReadOnly(disk.to_string()));
    }

    debug!(
        "{}: {} bytes, content {:?}, {} partitions",
        disk,
        probe.size,
        probe.content.name,
        probe.partitions.len()
    );
    Ok(DiskState { probe })
}

/// Like [`check`], and the disk must be empty unless it is going to be wiped.
pub fn check_install(disk: &str, wipe: bool) -> Result<DiskState> {
    let state = check(disk)?;
    if !wipe && !state.is_empty() {
        return Err(InstallError::NotEmpty(disk.to_string()));
    }
    Ok(state)
}

fn check_not_mounted(disk: &str, probe: &DeviceProbe) -> Result<()> {
    let mut devices = vec![disk];
    devices.extend(probe.partitions.iter().map(|partition| partition.dev_path.as_str()));

    for entry in read_mountinfo()? {
        if devices.contains(&entry.source.as_str()) {
            return Err(InstallError::Mounted {
                disk: disk.to_string(),
                device: entry.source.clone(),
                mount_point: entry.mount_point.display().to_string(),
            });
        }
    }

    Ok(())
}

fn is_read_only(dev: &BlockDevice) -> Result<bool> {
    if !dev.is_block_device() {
        let metadata = dev.file().metadata().map_err(storage_sys::SysError::from)?;
        return Ok(metadata.permissions().readonly());
    }

    let name = Path::new(dev.path())
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let ro = fs::read_to_string(format!("/sys/class/block/{}/ro", name)).unwrap_or_default();
    Ok(ro.trim() == "1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use storage_sys::Gpt;
    use storage_types::partition_types::LINUX_FILESYSTEM;
    use storage_types::MIB;
    use uuid::Uuid;

    fn image(size: u64) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(size).unwrap();
        file
    }

    fn path(file: &tempfile::NamedTempFile) -> &str {
        file.path().to_str().unwrap()
    }

    fn write_table(file: &tempfile::NamedTempFile, labels: &[&str]) {
        let dev = BlockDevice::open_exclusive(path(file)).unwrap();
        let mut gpt = Gpt::new(dev.size().unwrap(), dev.sector_size()).unwrap();
        for label in labels {
            gpt.allocate(MIB, label, Uuid::parse_str(LINUX_FILESYSTEM).unwrap())
                .unwrap();
        }
        gpt.write(&dev).unwrap();
    }

    #[test]
    fn blank_and_empty_tables_are_empty() {
        let img = image(64 * MIB);
        assert!(check_install(path(&img), false).unwrap().is_empty());

        write_table(&img, &[]);
        assert!(check_install(path(&img), false).unwrap().is_empty());
    }

    #[test]
    fn partitions_need_a_wipe() {
        let img = image(64 * MIB);
        write_table(&img, &["DATA"]);

        let err = check_install(path(&img), false).unwrap_err();
        assert_eq!(err.to_string(), format!("disk {} is not empty", path(&img)));
        assert!(!check_install(path(&img), true).unwrap().is_empty());
    }

    #[test]
    fn missing_disk() {
        let err = check("/nonexistent/disk").unwrap_err();
        assert!(matches!(err, InstallError::Sys(storage_sys::SysError::DeviceNotFound(_))), "{}", err);
    }

    #[test]
    fn read_only_image() {
        let img = image(64 * MIB);
        fs::set_permissions(img.path(), fs::Permissions::from_mode(0o444)).unwrap();
        assert!(matches!(check(path(&img)), Err(InstallError::ReadOnly(_))));
    }
}
