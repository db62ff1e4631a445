// SPDX-License-Identifier: GPL-3.0-only

//! Mount, unmount and mount target preparation.

use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::unistd::{Gid, Uid, chown};
use storage_contracts::{MountBackend, MountPoint, TargetSettings, VolumeResult};
use tracing::{debug, info, warn};

use crate::{Result, SysError};

/// How long `EBUSY`/`ENOENT` from the mount syscall are retried.
const MOUNT_RETRY_TIMEOUT: Duration = Duration::from_secs(5);
const MOUNT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

const SELINUX_XATTR: &str = "security.selinux";
const SELINUX_FS: &str = "/sys/fs/selinux";

// linux/swap.h
const SWAP_FLAG_DISCARD: libc::c_int = 0x10000;
const SWAP_FLAG_DISCARD_ONCE: libc::c_int = 0x20000;

/// One line of `/proc/self/mountinfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_point: PathBuf,
    pub source: String,
    pub fs_type: String,
    pub options: String,
}

impl MountEntry {
    pub fn is_read_only(&self) -> bool {
        self.options.split(',').any(|opt| opt == "ro")
    }
}

/// Undo the octal escapes mountinfo uses for spaces and friends.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        let escaped = bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b));
        if escaped {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            out.push(value as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8_lossy(&out).to_string()
}

pub fn parse_mountinfo(input: &str) -> Result<Vec<MountEntry>> {
    let mut entries = Vec::new();

    for line in input.lines().filter(|line| !line.trim().is_empty()) {
        let invalid = || SysError::Parse(format!("invalid mountinfo line: {}", line));

        let (left, right) = line.split_once(" - ").ok_or_else(invalid)?;

        let left_fields: Vec<&str> = left.split_whitespace().collect();
        let mount_point = left_fields.get(4).ok_or_else(invalid)?;
        let options = left_fields.get(5).ok_or_else(invalid)?;

        let mut right_fields = right.split_whitespace();
        let fs_type = right_fields.next().ok_or_else(invalid)?;
        let source = right_fields.next().unwrap_or_default();

        entries.push(MountEntry {
            mount_point: PathBuf::from(unescape(mount_point)),
            source: unescape(source),
            fs_type: fs_type.to_string(),
            options: options.to_string(),
        });
    }

    Ok(entries)
}

pub fn read_mountinfo() -> Result<Vec<MountEntry>> {
    parse_mountinfo(&fs::read_to_string("/proc/self/mountinfo")?)
}

/// The topmost mount at `target`, if any.
pub fn find_mount(target: &str) -> Result<Option<MountEntry>> {
    let target = Path::new(target);
    Ok(read_mountinfo()?
        .into_iter()
        .rev()
        .find(|entry| entry.mount_point == target))
}

/// Whether `dev_path` is the source of any mount.
pub fn is_source_mounted(dev_path: &str) -> Result<bool> {
    Ok(read_mountinfo()?.iter().any(|entry| entry.source == dev_path))
}

fn mount_flags(point: &MountPoint) -> MsFlags {
    let mut flags = MsFlags::empty();
    if point.read_only {
        flags |= MsFlags::MS_RDONLY;
    }
    if point.noatime {
        flags |= MsFlags::MS_NOATIME;
    }
    if point.bind {
        flags |= MsFlags::MS_BIND;
    }
    flags
}

/// Mount `point`, retrying while the source node is busy or not there yet.
pub fn mount_point(point: &MountPoint) -> Result<()> {
    let flags = mount_flags(point);
    let fstype = (!point.filesystem.is_empty()).then_some(point.filesystem.as_str());
    let data = (!point.data.is_empty()).then_some(point.data.as_str());
    let deadline = Instant::now() + MOUNT_RETRY_TIMEOUT;

    loop {
        match mount(Some(point.source.as_str()), point.target.as_str(), fstype, flags, data) {
            Ok(()) => break,
            Err(err @ (Errno::EBUSY | Errno::ENOENT)) if Instant::now() < deadline => {
                debug!("mount {} on {} failed, retrying: {}", point.source, point.target, err);
                thread::sleep(MOUNT_RETRY_INTERVAL);
            }
            Err(err) => {
                return Err(SysError::OperationFailed(format!(
                    "failed to mount {} on {}: {}",
                    point.source, point.target, err
                )));
            }
        }
    }

    // a read-only bind mount needs a second pass to take effect
    if point.bind && point.read_only {
        remount(&point.target, true, true)?;
    }

    Ok(())
}

/// Unmount `target`; a target that is not mounted is fine.
pub fn unmount(target: &str) -> Result<()> {
    match umount2(target, MntFlags::empty()) {
        Ok(()) | Err(Errno::EINVAL) | Err(Errno::ENOENT) => Ok(()),
        Err(Errno::EBUSY) => Err(SysError::Busy(target.to_string())),
        Err(err) => Err(SysError::OperationFailed(format!("failed to unmount {}: {}", target, err))),
    }
}

pub fn remount(target: &str, read_only: bool, bind: bool) -> Result<()> {
    let mut flags = MsFlags::MS_REMOUNT;
    if read_only {
        flags |= MsFlags::MS_RDONLY;
    }
    if bind {
        flags |= MsFlags::MS_BIND;
    }

    mount(None::<&str>, target, None::<&str>, flags, None::<&str>).map_err(|err| {
        SysError::OperationFailed(format!(
            "failed to remount {} {}: {}",
            target,
            if read_only { "ro" } else { "rw" },
            err
        ))
    })
}

/// A filesystem mounted on a private directory for the lifetime of the guard.
#[derive(Debug)]
pub struct TempMount {
    dir: PathBuf,
    mounted: bool,
}

impl TempMount {
    pub fn new(source: &str, filesystem: &str) -> Result<Self> {
        let dir = std::env::temp_dir().join(format!("volume-mnt-{}", uuid::Uuid::new_v4().simple()));
        fs::create_dir_all(&dir)?;

        let mut guard = Self { dir, mounted: false };
        mount_point(&MountPoint {
            source: source.to_string(),
            target: guard.path_str(),
            filesystem: filesystem.to_string(),
            ..Default::default()
        })?;
        guard.mounted = true;

        Ok(guard)
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn path_str(&self) -> String {
        self.dir.display().to_string()
    }
}

impl Drop for TempMount {
    fn drop(&mut self) {
        if self.mounted
            && let Err(err) = unmount(&self.path_str())
        {
            warn!("failed to unmount {}: {}", self.dir.display(), err);
            return;
        }
        let _ = fs::remove_dir(&self.dir);
    }
}

fn selinux_enabled() -> bool {
    Path::new(SELINUX_FS).join("enforce").exists()
}

fn set_selinux_label(path: &Path, label: &str) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| SysError::OperationFailed(format!("invalid path {}", path.display())))?;
    let name = CString::new(SELINUX_XATTR)
        .map_err(|_| SysError::OperationFailed("invalid xattr name".to_string()))?;

    // SAFETY: both strings are NUL-terminated and outlive the call; the value
    // pointer and length describe `label`.
    let rc = unsafe {
        libc::lsetxattr(
            c_path.as_ptr(),
            name.as_ptr(),
            label.as_ptr() as *const libc::c_void,
            label.len(),
            0,
        )
    };
    if rc < 0 {
        return Err(Errno::last().into());
    }
    Ok(())
}

fn apply_one(path: &Path, settings: &TargetSettings, selinux: bool) -> Result<()> {
    let meta = fs::symlink_metadata(path)?;

    if !meta.file_type().is_symlink() {
        if settings.file_mode != 0 {
            fs::set_permissions(path, fs::Permissions::from_mode(settings.file_mode))?;
        }
        chown(
            path,
            Some(Uid::from_raw(settings.uid)),
            Some(Gid::from_raw(settings.gid)),
        )?;
    }

    if selinux && !settings.selinux_label.is_empty() {
        set_selinux_label(path, &settings.selinux_label)?;
    }

    Ok(())
}

fn relabel_tree(dir: &Path, settings: &TargetSettings) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        set_selinux_label(&path, &settings.selinux_label)?;
        if entry.file_type()?.is_dir() {
            relabel_tree(&path, settings)?;
        }
    }
    Ok(())
}

/// Apply mode, ownership and SELinux label to `path`.
pub fn apply_settings(path: &Path, settings: &TargetSettings) -> Result<()> {
    let selinux = selinux_enabled();
    apply_one(path, settings, selinux)?;

    if selinux && settings.recursive && !settings.selinux_label.is_empty() && path.is_dir() {
        relabel_tree(path, settings)?;
    }

    Ok(())
}

/// Point `link` at `target`.
pub fn ensure_symlink(target: &str, link: &str, force: bool) -> Result<()> {
    let link_path = Path::new(link);

    match fs::symlink_metadata(link_path) {
        Ok(meta) => {
            if meta.file_type().is_symlink() && fs::read_link(link_path)? == Path::new(target) {
                return Ok(());
            }
            if !force {
                return Err(SysError::OperationFailed(format!(
                    "{} already exists and is not a symlink to {}",
                    link, target
                )));
            }
            if meta.is_dir() {
                fs::remove_dir_all(link_path)?;
            } else {
                fs::remove_file(link_path)?;
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }

    if let Some(parent) = link_path.parent() {
        fs::create_dir_all(parent)?;
    }
    symlink(target, link_path)?;
    Ok(())
}

pub fn swap_on(dev_path: &str) -> Result<()> {
    let path = CString::new(dev_path)
        .map_err(|_| SysError::OperationFailed(format!("invalid path {}", dev_path)))?;

    // SAFETY: `path` is NUL-terminated and lives across the call.
    let rc = unsafe { libc::swapon(path.as_ptr(), SWAP_FLAG_DISCARD | SWAP_FLAG_DISCARD_ONCE) };
    if rc < 0 {
        return match Errno::last() {
            Errno::EBUSY => Ok(()),
            err => Err(SysError::OperationFailed(format!("swapon {}: {}", dev_path, err))),
        };
    }
    Ok(())
}

pub fn swap_off(dev_path: &str) -> Result<()> {
    let path = CString::new(dev_path)
        .map_err(|_| SysError::OperationFailed(format!("invalid path {}", dev_path)))?;

    // SAFETY: `path` is NUL-terminated and lives across the call.
    let rc = unsafe { libc::swapoff(path.as_ptr()) };
    if rc < 0 {
        return match Errno::last() {
            Errno::EINVAL => Ok(()),
            err => Err(SysError::OperationFailed(format!("swapoff {}: {}", dev_path, err))),
        };
    }
    Ok(())
}

/// [`MountBackend`] issuing real syscalls.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMountBackend;

impl MountBackend for SystemMountBackend {
    fn mount(&self, point: &MountPoint) -> VolumeResult<()> {
        fs::create_dir_all(&point.target).map_err(SysError::from)?;
        mount_point(point)?;
        info!(
            "mounted {} on {} ({}{})",
            point.source,
            point.target,
            if point.filesystem.is_empty() { "bind" } else { &point.filesystem },
            if point.read_only { ", ro" } else { "" }
        );
        Ok(())
    }

    fn unmount(&self, target: &str) -> VolumeResult<()> {
        unmount(target)?;
        info!("unmounted {}", target);
        Ok(())
    }

    fn remount(&self, target: &str, read_only: bool) -> VolumeResult<()> {
        Ok(remount(target, read_only, false)?)
    }

    fn ensure_directory(&self, path: &str) -> VolumeResult<()> {
        fs::create_dir_all(path).map_err(SysError::from)?;
        Ok(())
    }

    fn ensure_symlink(&self, target: &str, link: &str, force: bool) -> VolumeResult<()> {
        Ok(ensure_symlink(target, link, force)?)
    }

    fn apply_settings(&self, path: &str, settings: &TargetSettings) -> VolumeResult<()> {
        Ok(apply_settings(Path::new(path), settings)?)
    }

    fn swap_on(&self, dev_path: &str) -> VolumeResult<()> {
        Ok(swap_on(dev_path)?)
    }

    fn swap_off(&self, dev_path: &str) -> VolumeResult<()> {
        Ok(swap_off(dev_path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTINFO: &str = "\
22 1 0:21 / / rw,relatime shared:1 - xfs /dev/sda3 rw,attr2,inode64
23 22 0:22 / /var rw,noatime shared:2 - xfs /dev/mapper/sda2-encrypted rw,prjquota
24 22 0:23 / /mnt/with\\040space ro,relatime - ext4 /dev/sdb1 ro
";

    #[test]
    fn parses_mountinfo_lines() {
        let entries = parse_mountinfo(MOUNTINFO).unwrap();
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[1].mount_point, PathBuf::from("/var"));
        assert_eq!(entries[1].source, "/dev/mapper/sda2-encrypted");
        assert_eq!(entries[1].fs_type, "xfs");
        assert!(!entries[1].is_read_only());

        assert_eq!(entries[2].mount_point, PathBuf::from("/mnt/with space"));
        assert!(entries[2].is_read_only());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_mountinfo("not a mountinfo line").is_err());
    }

    #[test]
    fn flags_follow_the_mount_point() {
        let point = MountPoint {
            read_only: true,
            noatime: true,
            ..Default::default()
        };
        assert_eq!(mount_flags(&point), MsFlags::MS_RDONLY | MsFlags::MS_NOATIME);
        assert!(mount_flags(&MountPoint::default()).is_empty());
    }

    #[test]
    fn symlinks_are_replaced_only_with_force() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("var/run");
        let link = link.to_str().unwrap();

        ensure_symlink("/run", link, false).unwrap();
        assert_eq!(fs::read_link(link).unwrap(), PathBuf::from("/run"));
        ensure_symlink("/run", link, false).unwrap();

        assert!(ensure_symlink("/elsewhere", link, false).is_err());
        ensure_symlink("/elsewhere", link, true).unwrap();
        assert_eq!(fs::read_link(link).unwrap(), PathBuf::from("/elsewhere"));
    }

    #[test]
    fn applies_file_mode() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("state");
        fs::create_dir(&target).unwrap();

        let settings = TargetSettings {
            file_mode: 0o700,
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            ..Default::default()
        };
        apply_settings(&target, &settings).unwrap();

        let mode = fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
