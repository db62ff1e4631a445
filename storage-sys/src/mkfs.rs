// SPDX-License-Identifier: GPL-3.0-only

//! Filesystem creation and growth through `mkfs.*`, `mkswap`, `xfs_growfs`
//! and `resize2fs`.

use std::sync::Arc;

use storage_contracts::{FilesystemMaker, FormatOptions, VolumeError, VolumeResult};
use storage_types::{FilesystemType, MIB};
use tracing::{info, warn};

use crate::blockdev::BlockDevice;
use crate::command::CommandRunner;
use crate::mount::TempMount;

/// XFS refuses filesystems this small unless explicitly told otherwise.
pub const XFS_UNSUPPORTED_SIZE: u64 = 300 * MIB;

const VFAT_LABEL_MAX: usize = 11;

fn tool_for(filesystem: FilesystemType) -> Option<&'static str> {
    match filesystem {
        FilesystemType::Xfs if cfg!(feature = "fs-xfs") => Some("mkfs.xfs"),
        FilesystemType::Ext4 if cfg!(feature = "fs-ext4") => Some("mkfs.ext4"),
        FilesystemType::Vfat if cfg!(feature = "fs-vfat") => Some("mkfs.vfat"),
        FilesystemType::Swap if cfg!(feature = "swap") => Some("mkswap"),
        _ => None,
    }
}

/// Arguments for formatting a device of `size` bytes.
pub fn format_args(dev_path: &str, size: u64, options: &FormatOptions, xfs_config: Option<&str>) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    let mut push = |arg: &str| args.push(arg.to_string());

    match options.filesystem {
        FilesystemType::Xfs => {
            push("-f");
            if let Some(config) = xfs_config {
                push("-c");
                push(&format!("options={}", config));
            }
            if !options.label.is_empty() {
                push("-L");
                push(&options.label);
            }
            if !options.discard {
                push("-K");
            }
            if size <= XFS_UNSUPPORTED_SIZE {
                push("--unsupported");
            }
        }
        FilesystemType::Ext4 => {
            push("-F");
            if !options.label.is_empty() {
                push("-L");
                push(&options.label);
            }
            if options.project_quota {
                push("-O");
                push("quota,project");
                push("-E");
                push(if options.discard {
                    "quotatype=prjquota"
                } else {
                    "quotatype=prjquota,nodiscard"
                });
            } else if !options.discard {
                push("-E");
                push("nodiscard");
            }
        }
        FilesystemType::Vfat => {
            push("-F");
            push("32");
            if !options.label.is_empty() {
                push("-n");
                let label: String = options.label.to_uppercase().chars().take(VFAT_LABEL_MAX).collect();
                push(&label);
            }
        }
        FilesystemType::Swap => {
            if !options.label.is_empty() {
                push("-L");
                push(&options.label);
            }
            push("-U");
            push(&uuid::Uuid::new_v4().to_string());
        }
        FilesystemType::None => {}
    }

    args.push(dev_path.to_string());
    args
}

/// [`FilesystemMaker`] running the distribution tools.
#[derive(Clone)]
pub struct SystemFilesystemMaker {
    runner: Arc<dyn CommandRunner>,
    xfs_config: Option<String>,
}

impl std::fmt::Debug for SystemFilesystemMaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemFilesystemMaker")
            .field("xfs_config", &self.xfs_config)
            .finish()
    }
}

impl SystemFilesystemMaker {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            xfs_config: None,
        }
    }

    /// Pass `-c options=<path>` to `mkfs.xfs`, pinning its feature set.
    pub fn with_xfs_config(mut self, path: impl Into<String>) -> Self {
        self.xfs_config = Some(path.into());
        self
    }

    fn run(&self, command: &str, args: &[String]) -> VolumeResult<()> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.runner.run(command, &args, None)?;
        Ok(())
    }
}

impl FilesystemMaker for SystemFilesystemMaker {
    fn format(&self, dev_path: &str, options: &FormatOptions) -> VolumeResult<()> {
        let tool = tool_for(options.filesystem).ok_or_else(|| {
            VolumeError::config(format!("unsupported filesystem type {}", options.filesystem))
        })?;

        if !self.runner.available(tool) {
            return Err(VolumeError::system(format!("{} not found in PATH", tool)));
        }

        let size = BlockDevice::open_shared(dev_path)?.size()?;
        let args = format_args(dev_path, size, options, self.xfs_config.as_deref());
        self.run(tool, &args)?;

        info!("formatted {} as {} (label {:?})", dev_path, options.filesystem, options.label);
        Ok(())
    }

    fn grow(&self, dev_path: &str, filesystem: FilesystemType) -> VolumeResult<()> {
        match filesystem {
            FilesystemType::Xfs => {
                // xfs only grows while mounted
                let mnt = TempMount::new(dev_path, "xfs")?;
                self.run("xfs_growfs", &["-d".to_string(), mnt.path_str()])?;
            }
            FilesystemType::Ext4 => {
                self.run("resize2fs", &[dev_path.to_string()])?;
            }
            other => {
                warn!("growing {} filesystems is not supported, leaving {} as is", other, dev_path);
                return Ok(());
            }
        }

        info!("grew {} filesystem on {}", filesystem, dev_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(filesystem: FilesystemType, label: &str) -> FormatOptions {
        FormatOptions {
            filesystem,
            label: label.to_string(),
            discard: true,
            ..Default::default()
        }
    }

    #[test]
    fn small_xfs_opts_into_unsupported_sizes() {
        let small = format_args("/dev/sda2", 100 * MIB, &options(FilesystemType::Xfs, "STATE"), None);
        assert_eq!(small, ["-f", "-L", "STATE", "--unsupported", "/dev/sda2"]);

        let boundary = format_args("/dev/sda2", XFS_UNSUPPORTED_SIZE, &options(FilesystemType::Xfs, ""), None);
        assert!(boundary.contains(&"--unsupported".to_string()));

        let large = format_args("/dev/sda3", 8 * 1024 * MIB, &options(FilesystemType::Xfs, "EPHEMERAL"), None);
        assert!(!large.contains(&"--unsupported".to_string()));
    }

    #[test]
    fn xfs_config_file_is_passed() {
        let args = format_args(
            "/dev/sda3",
            1024 * MIB,
            &options(FilesystemType::Xfs, ""),
            Some("/usr/share/xfsprogs/mkfs/lts_6.6.conf"),
        );
        assert_eq!(args[1..3], ["-c", "options=/usr/share/xfsprogs/mkfs/lts_6.6.conf"]);
    }

    #[test]
    fn ext4_project_quota() {
        let mut opts = options(FilesystemType::Ext4, "data");
        opts.project_quota = true;
        let args = format_args("/dev/vdb1", 1024 * MIB, &opts, None);
        assert_eq!(args, ["-F", "-L", "data", "-O", "quota,project", "-E", "quotatype=prjquota", "/dev/vdb1"]);
    }

    #[test]
    fn vfat_labels_are_truncated() {
        let args = format_args("/dev/sda1", 100 * MIB, &options(FilesystemType::Vfat, "efi-system-part"), None);
        assert_eq!(args, ["-F", "32", "-n", "EFI-SYSTEM-", "/dev/sda1"]);
    }

    #[test]
    fn swap_gets_a_fresh_uuid() {
        let first = format_args("/dev/sdb1", MIB, &options(FilesystemType::Swap, ""), None);
        let second = format_args("/dev/sdb1", MIB, &options(FilesystemType::Swap, ""), None);
        assert_eq!(first[0], "-U");
        assert_ne!(first[1], second[1]);
    }
}
