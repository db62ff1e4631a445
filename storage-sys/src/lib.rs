// SPDX-License-Identifier: GPL-3.0-only

//! Low-level system operations for the volume engine
//!
//! Everything that touches the kernel or an external tool lives here:
//! - block device open with advisory locking, ioctls, GPT read/write
//! - superblock probing, signature wiping, the META key/value store
//! - netlink uevents, inotify on `/dev`, the sysfs walk
//! - mount/unmount, `mkfs.*`, `cryptsetup`, `lvm`, swap and zswap
//!
//! These operations require elevated privileges; the engine reaches them
//! through the traits of `storage-contracts`.

pub mod blockdev;
pub mod command;
pub mod cryptsetup;
pub mod error;
pub mod gpt;
pub mod inotify;
pub mod lvm;
pub mod meta;
pub mod mkfs;
pub mod mount;
pub mod partition_backend;
pub mod probe;
pub mod swap;
pub mod sysfs;
pub mod uevent;
pub mod wipe;

use std::os::fd::BorrowedFd;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

pub use blockdev::{BlockDevice, LockMode};
pub use command::{CommandOutcome, CommandRunner, SystemRunner};
pub use cryptsetup::Luks2;
pub use error::{Result, SysError};
pub use gpt::Gpt;
pub use meta::{Meta, SystemMeta};
pub use mkfs::SystemFilesystemMaker;
pub use mount::{SystemMountBackend, TempMount};
pub use partition_backend::GptBackend;
pub use probe::{SystemProber, probe_device};

/// Wait up to `timeout_ms` for `fd` to become readable.
pub(crate) fn wait_readable(fd: BorrowedFd<'_>, timeout_ms: u16) -> Result<bool> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];

    match poll(&mut fds, PollTimeout::from(timeout_ms)) {
        Ok(n) => Ok(n > 0),
        Err(Errno::EINTR) => Ok(false),
        Err(err) => Err(err.into()),
    }
}
