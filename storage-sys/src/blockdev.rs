// SPDX-License-Identifier: GPL-3.0-only

//! Block device handles.
//!
//! A [`BlockDevice`] is an open device node holding an advisory `flock`. The
//! lock is released when the handle is dropped, on every exit path. Regular
//! files are accepted too (disk images), with sizes taken from `fstat`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

use crate::{Result, SysError};

/// How long lock acquisition is retried before giving up.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

// linux/fs.h
const BLKRRPART: u64 = 0x125f;
const BLKSSZGET: u64 = 0x1268;
const BLKPG: u64 = 0x1269;
const BLKIOMIN: u64 = 0x1278;
const BLKGETSIZE64: u64 = 0x80081272;

// linux/blkpg.h
const BLKPG_ADD_PARTITION: libc::c_int = 1;
const BLKPG_DEL_PARTITION: libc::c_int = 2;
const BLKPG_RESIZE_PARTITION: libc::c_int = 3;

const BLKPG_DEVNAMELTH: usize = 64;
const BLKPG_VOLNAMELTH: usize = 64;

#[repr(C)]
struct BlkpgPartition {
    start: libc::c_longlong,
    length: libc::c_longlong,
    pno: libc::c_int,
    devname: [libc::c_char; BLKPG_DEVNAMELTH],
    volname: [libc::c_char; BLKPG_VOLNAMELTH],
}

#[repr(C)]
struct BlkpgIoctlArg {
    op: libc::c_int,
    flags: libc::c_int,
    datalen: libc::c_int,
    data: *mut libc::c_void,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Readers (probing).
    Shared,
    /// Partition table and header writers.
    Exclusive,
}

#[derive(Debug)]
pub struct BlockDevice {
    file: Flock<File>,
    path: String,
    is_block: bool,
}

impl BlockDevice {
    /// Open `path` read-only under a shared lock.
    pub fn open_shared(path: &str) -> Result<Self> {
        Self::open(path, false, LockMode::Shared, LOCK_TIMEOUT)
    }

    /// Open `path` read-write under an exclusive lock.
    pub fn open_exclusive(path: &str) -> Result<Self> {
        Self::open(path, true, LockMode::Exclusive, LOCK_TIMEOUT)
    }

    pub fn open(path: &str, writable: bool, mode: LockMode, timeout: Duration) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => SysError::DeviceNotFound(path.to_string()),
                std::io::ErrorKind::PermissionDenied => SysError::PermissionDenied(path.to_string()),
                _ => SysError::Io(err),
            })?;

        let is_block = file.metadata()?.file_type().is_block_device();
        let file = lock_with_timeout(file, path, mode, timeout)?;

        Ok(Self {
            file,
            path: path.to_string(),
            is_block,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_block_device(&self) -> bool {
        self.is_block
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// Size in bytes.
    pub fn size(&self) -> Result<u64> {
        if !self.is_block {
            return Ok(self.file.metadata()?.len());
        }

        let mut size: u64 = 0;
        // SAFETY: BLKGETSIZE64 writes a u64 into the provided pointer.
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), BLKGETSIZE64 as _, &mut size) };
        if rc < 0 {
            return Err(Errno::last().into());
        }
        Ok(size)
    }

    /// Logical sector size; 512 for regular files.
    pub fn sector_size(&self) -> u64 {
        if !self.is_block {
            return 512;
        }

        let mut size: libc::c_int = 0;
        // SAFETY: BLKSSZGET writes an int into the provided pointer.
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), BLKSSZGET as _, &mut size) };
        if rc < 0 || size <= 0 {
            return sysfs_sector_size(&self.path).unwrap_or(512);
        }
        size as u64
    }

    /// Minimum IO size; falls back to the sector size.
    pub fn io_size(&self) -> u64 {
        if !self.is_block {
            return self.sector_size();
        }

        let mut size: libc::c_uint = 0;
        // SAFETY: BLKIOMIN writes an unsigned int into the provided pointer.
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), BLKIOMIN as _, &mut size) };
        if rc < 0 || size == 0 {
            return self.sector_size();
        }
        size as u64
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = &*self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Read up to `len` bytes at `offset`, shorter when the device ends first.
    pub fn read_up_to(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut file = &*self.file;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut file = &*self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Ask the kernel to re-read the whole partition table.
    ///
    /// Fails with `EBUSY` when any partition is in use.
    pub fn reread_partitions(&self) -> Result<()> {
        if !self.is_block {
            return Ok(());
        }

        // SAFETY: BLKRRPART takes no argument.
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), BLKRRPART as _, 0) };
        if rc < 0 {
            return Err(Errno::last().into());
        }
        Ok(())
    }

    /// Tell the kernel about a new partition without re-reading the table.
    pub fn inform_add(&self, number: u32, start: u64, length: u64) -> Result<()> {
        self.blkpg(BLKPG_ADD_PARTITION, number, start, length)
    }

    pub fn inform_resize(&self, number: u32, start: u64, length: u64) -> Result<()> {
        self.blkpg(BLKPG_RESIZE_PARTITION, number, start, length)
    }

    pub fn inform_delete(&self, number: u32) -> Result<()> {
        self.blkpg(BLKPG_DEL_PARTITION, number, 0, 0)
    }

    fn blkpg(&self, op: libc::c_int, number: u32, start: u64, length: u64) -> Result<()> {
        if !self.is_block {
            return Ok(());
        }

        let mut partition = BlkpgPartition {
            start: start as libc::c_longlong,
            length: length as libc::c_longlong,
            pno: number as libc::c_int,
            devname: [0; BLKPG_DEVNAMELTH],
            volname: [0; BLKPG_VOLNAMELTH],
        };
        let mut arg = BlkpgIoctlArg {
            op,
            flags: 0,
            datalen: std::mem::size_of::<BlkpgPartition>() as libc::c_int,
            data: &mut partition as *mut BlkpgPartition as *mut libc::c_void,
        };

        // SAFETY: `arg` and the partition it points to outlive the call.
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), BLKPG as _, &mut arg) };
        if rc < 0 {
            return Err(Errno::last().into());
        }
        Ok(())
    }
}

fn lock_with_timeout(
    mut file: File,
    path: &str,
    mode: LockMode,
    timeout: Duration,
) -> Result<Flock<File>> {
    let arg = match mode {
        LockMode::Shared => FlockArg::LockSharedNonblock,
        LockMode::Exclusive => FlockArg::LockExclusiveNonblock,
    };
    let deadline = Instant::now() + timeout;

    loop {
        match Flock::lock(file, arg) {
            Ok(locked) => return Ok(locked),
            Err((returned, Errno::EAGAIN)) | Err((returned, Errno::EINTR)) => {
                if Instant::now() >= deadline {
                    return Err(SysError::LockTimeout(path.to_string()));
                }
                debug!("{} is locked, retrying", path);
                file = returned;
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err((_, errno)) => return Err(errno.into()),
        }
    }
}

/// `/sys/class/block/<name>/queue/logical_block_size`.
fn sysfs_sector_size(dev_path: &str) -> Option<u64> {
    let name = Path::new(dev_path).file_name()?.to_str()?;
    let queue = Path::new("/sys/class/block")
        .join(name)
        .join("queue/logical_block_size");
    std::fs::read_to_string(queue).ok()?.trim().parse().ok()
}
