// SPDX-License-Identifier: GPL-3.0-only

//! Block devices as seen through sysfs.
//!
//! All paths are resolved against a configurable root so the walk can be
//! exercised against a fabricated tree.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::Result;
use crate::uevent::{Uevent, from_uevent_file};

const SECTOR: u64 = 512;
const CDROM_MAJOR: u32 = 11;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskProperties {
    pub size: u64,
    pub sector_size: u64,
    pub io_size: u64,
    pub readonly: bool,
    pub rotational: bool,
    pub removable: bool,
    pub cdrom: bool,
    pub model: String,
    pub serial: String,
    pub wwid: String,
    pub modalias: String,
    pub transport: String,
    pub bus_path: String,
    pub sub_system: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sysfs {
    root: PathBuf,
}

impl Default for Sysfs {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl Sysfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute directory of a kernel `DEVPATH` (`/devices/...`).
    pub fn device_dir(&self, dev_path: &str) -> PathBuf {
        self.root.join(dev_path.trim_start_matches('/'))
    }

    pub fn exists(&self, dir: &Path) -> bool {
        dir.exists()
    }

    /// Synthesize `add` events for every block device, disks before their partitions.
    pub fn walk_block(&self) -> Result<Vec<Uevent>> {
        let class = self.root.join("class/block");
        let mut events = Vec::new();

        for entry in fs::read_dir(&class)? {
            let entry = entry?;
            let dir = match fs::canonicalize(entry.path()) {
                Ok(dir) => dir,
                Err(err) => {
                    debug!("skipping {}: {}", entry.path().display(), err);
                    continue;
                }
            };

            let content = match fs::read_to_string(dir.join("uevent")) {
                Ok(content) => content,
                Err(err) => {
                    debug!("skipping {}: {}", dir.display(), err);
                    continue;
                }
            };

            let dev_path = self.relative(&dir);
            events.push(from_uevent_file(&dev_path, &content));
        }

        events.sort_by(|a, b| {
            (a.dev_type() == "partition", &a.dev_path).cmp(&(b.dev_type() == "partition", &b.dev_path))
        });

        Ok(events)
    }

    fn relative(&self, dir: &Path) -> String {
        let root = fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone());
        match dir.strip_prefix(&root) {
            Ok(rel) => format!("/{}", rel.display()),
            Err(_) => dir.display().to_string(),
        }
    }

    /// Devices a composite device is built from (`slaves/`).
    pub fn secondaries(&self, dir: &Path) -> Vec<String> {
        list_dir(&dir.join("slaves"))
    }

    /// Devices built on top of this one (`holders/`).
    pub fn holders(&self, dir: &Path) -> Vec<String> {
        list_dir(&dir.join("holders"))
    }

    /// Attributes of the disk at `dir` with kernel major `major`.
    pub fn disk_properties(&self, dir: &Path, major: u32) -> DiskProperties {
        let attr = |name: &str| read_attr(&dir.join(name));
        let flag = |name: &str| attr(name) == "1";
        let number = |name: &str| attr(name).parse::<u64>().unwrap_or_default();

        let canonical = fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
        let dev_path = self.relative(&canonical);

        let sector_size = match number("queue/logical_block_size") {
            0 => SECTOR,
            n => n,
        };

        let serial = first_non_empty(&[attr("device/serial"), attr("serial")]);
        let wwid = first_non_empty(&[attr("wwid"), attr("device/wwid")]);

        let sub_system = fs::canonicalize(dir.join("subsystem"))
            .map(|link| self.relative(&link))
            .unwrap_or_default();

        DiskProperties {
            size: number("size") * SECTOR,
            sector_size,
            io_size: number("queue/minimum_io_size"),
            readonly: flag("ro"),
            rotational: flag("queue/rotational"),
            removable: flag("removable"),
            cdrom: major == CDROM_MAJOR,
            model: attr("device/model"),
            serial,
            wwid,
            modalias: attr("device/modalias"),
            transport: transport(&dev_path).to_string(),
            bus_path: bus_path(&dev_path),
            sub_system,
        }
    }
}

fn read_attr(path: &Path) -> String {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn first_non_empty(values: &[String]) -> String {
    values
        .iter()
        .find(|v| !v.is_empty())
        .cloned()
        .unwrap_or_default()
}

fn list_dir(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

/// Transport derived from a `DEVPATH`.
pub fn transport(dev_path: &str) -> &'static str {
    let has = |needle: &str| dev_path.contains(needle);

    if has("/nvme/") {
        "nvme"
    } else if has("/usb") {
        "usb"
    } else if has("/virtio") {
        "virtio"
    } else if has("/mmc_host/") || has("/mmcblk") {
        "mmc"
    } else if has("/ata") {
        "sata"
    } else if has("/host") && has("/target") {
        "scsi"
    } else {
        ""
    }
}

/// Bus path of a `DEVPATH`: everything between `/devices` and `/block`.
pub fn bus_path(dev_path: &str) -> String {
    let path = dev_path.strip_prefix("/devices").unwrap_or(dev_path);
    match path.find("/block/") {
        Some(at) => path[..at].to_string(),
        None => path.to_string(),
    }
}
