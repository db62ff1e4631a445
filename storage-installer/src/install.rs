// SPDX-License-Identifier: GPL-3.0-only

//! Fresh installs and upgrades.

use std::sync::Arc;

use serde::Serialize;
use storage_contracts::{FilesystemMaker, FormatOptions};
use storage_sys::probe::partition_dev_path;
use storage_sys::wipe::{FAST_WIPE_RANGE, fast_wipe, wipe, wipe_range};
use storage_sys::{BlockDevice, Gpt, Meta};
use storage_types::constants::{META_PARTITION_LABEL, META_TAG_UPGRADE};
use tracing::{debug, info, warn};

use crate::manifest::{Arch, Manifest};
use crate::meta_values::MetaValue;
use crate::{InstallError, Result, preflight};

/// GPT attribute bit 2: legacy BIOS bootable.
pub const LEGACY_BIOS_BOOTABLE: u64 = 1 << 2;

/// Preserved contents are buffered in memory, so keep them small.
const MAX_PRESERVED_SIZE: u64 = 64 * storage_types::MIB;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOptions {
    pub disk: String,
    pub platform: String,
    pub arch: Arch,
    pub extra_kernel_args: Vec<String>,
    /// Replace whatever is on the disk.
    pub force: bool,
    /// Zero the whole disk rather than its ends.
    pub zero: bool,
    pub meta: Vec<MetaValue>,
}

/// A partition the installer laid out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedTarget {
    pub number: u32,
    pub label: String,
    pub partition_type: String,
    pub dev_path: String,
    pub preserved: bool,
}

/// Stored under the upgrade tag.
#[derive(Debug, Serialize)]
struct UpgradeRecord<'a> {
    version: &'a str,
    platform: &'a str,
    arch: Arch,
    extra_kernel_args: &'a [String],
}

pub struct Installer {
    options: InstallOptions,
    manifest: Manifest,
    formatter: Arc<dyn FilesystemMaker>,
}

impl Installer {
    pub fn new(options: InstallOptions, manifest: Manifest, formatter: Arc<dyn FilesystemMaker>) -> Self {
        Self {
            options,
            manifest,
            formatter,
        }
    }

    /// Lay the manifest out on the disk and seed META.
    pub fn install(&self) -> Result<Vec<PlacedTarget>> {
        let disk = self.options.disk.as_str();
        if self.options.zero && !self.options.force {
            return Err(InstallError::Manifest("zero option can't be used without force".into()));
        }
        self.manifest.validate()?;

        let state = preflight::check_install(disk, self.options.force)?;
        let dev = BlockDevice::open_exclusive(disk)?;
        let preserved = self.read_preserved(&dev, state.is_empty())?;

        if self.options.zero {
            info!("zeroing {}", disk);
            wipe(&dev)?;
        } else {
            fast_wipe(&dev)?;
        }

        let mut gpt = Gpt::new(dev.size()?, dev.sector_size())?;
        let mut placed = Vec::with_capacity(self.manifest.targets.len());
        for target in &self.manifest.targets {
            let number = gpt.allocate(target.size, &target.label, target.type_guid()?)?;
            if target.legacy_bios_bootable {
                gpt.set_attributes(number, LEGACY_BIOS_BOOTABLE)?;
            }
            placed.push(PlacedTarget {
                number,
                label: target.label.clone(),
                partition_type: target.partition_type.clone(),
                dev_path: partition_dev_path(disk, number),
                preserved: false,
            });
        }
        gpt.write(&dev)?;
        dev.reread_partitions()?;

        // stale superblocks and META copies from the previous layout
        let sector_size = gpt.sector_size();
        for entry in &placed {
            if let Some(partition) = gpt.partition(entry.number) {
                let offset = partition.offset(sector_size);
                wipe_range(&dev, offset, partition.size(sector_size).min(FAST_WIPE_RANGE))?;
            }
        }

        for (label, contents) in preserved {
            let Some(entry) = placed.iter_mut().find(|entry| entry.label == label) else {
                continue;
            };
            let Some(partition) = gpt.partition(entry.number) else {
                continue;
            };
            let len = partition.size(sector_size).min(contents.len() as u64) as usize;
            dev.write_at(partition.offset(sector_size), &contents[..len])?;
            entry.preserved = true;
            debug!("restored {} bytes of {}", len, label);
        }
        dev.sync()?;

        for (target, entry) in self.manifest.targets.iter().zip(&placed) {
            if entry.preserved || !target.needs_format() {
                continue;
            }
            self.formatter.format(
                &entry.dev_path,
                &FormatOptions {
                    filesystem: target.filesystem,
                    label: target.label.clone(),
                    ..Default::default()
                },
            )?;
        }

        self.seed_meta(&dev, &gpt, &[])?;

        if !self.options.extra_kernel_args.is_empty() {
            info!(
                "extra kernel arguments for the bootloader: {}",
                self.options.extra_kernel_args.join(" ")
            );
        }
        info!(
            "installed {} ({} {}) with {} partitions",
            disk,
            self.options.platform,
            self.options.arch,
            placed.len()
        );
        Ok(placed)
    }

    /// Leave the partitions alone and mark the disk as upgraded in META.
    pub fn upgrade(&self) -> Result<()> {
        let disk = self.options.disk.as_str();
        let dev = BlockDevice::open_exclusive(disk)?;
        let gpt = Gpt::read(&dev)?.ok_or_else(|| InstallError::NoPartitionTable(disk.to_string()))?;

        let record = serde_json::to_vec(&UpgradeRecord {
            version: env!("CARGO_PKG_VERSION"),
            platform: &self.options.platform,
            arch: self.options.arch,
            extra_kernel_args: &self.options.extra_kernel_args,
        })
        .map_err(|err| InstallError::MetaValue {
            value: "upgrade record".to_string(),
            reason: err.to_string(),
        })?;
        let upgrade = MetaValue {
            tag: META_TAG_UPGRADE,
            value: record,
        };

        self.seed_meta(&dev, &gpt, &[upgrade])?;
        info!("marked {} for upgrade", disk);
        Ok(())
    }

    /// Contents of `preserve_contents` targets found on the current table.
    fn read_preserved(&self, dev: &BlockDevice, empty: bool) -> Result<Vec<(String, Vec<u8>)>> {
        let wanted: Vec<&str> = self
            .manifest
            .targets
            .iter()
            .filter(|target| target.preserve_contents)
            .map(|target| target.label.as_str())
            .collect();
        if wanted.is_empty() || empty {
            return Ok(Vec::new());
        }

        let Some(current) = Gpt::read(dev)? else {
            return Ok(Vec::new());
        };

        let sector_size = current.sector_size();
        let mut preserved = Vec::new();
        for (_, partition) in current.partitions() {
            if !wanted.contains(&partition.name.as_str()) {
                continue;
            }
            let size = partition.size(sector_size);
            if size > MAX_PRESERVED_SIZE {
                warn!("{} is too large to preserve ({} bytes)", partition.name, size);
                continue;
            }
            let contents = dev.read_up_to(partition.offset(sector_size), size as usize)?;
            preserved.push((partition.name.clone(), contents));
        }

        Ok(preserved)
    }

    fn seed_meta(&self, dev: &BlockDevice, gpt: &Gpt, extra: &[MetaValue]) -> Result<()> {
        let (_, partition) = gpt
            .partitions()
            .find(|(_, partition)| partition.name == META_PARTITION_LABEL)
            .ok_or_else(|| InstallError::MissingPartition {
                disk: self.options.disk.clone(),
                label: META_PARTITION_LABEL.to_string(),
            })?;
        let offset = partition.offset(gpt.sector_size());
        let size = partition.size(gpt.sector_size());

        let mut meta = Meta::load_at(dev, offset)?;
        let mut changed = false;
        for value in extra.iter().chain(&self.options.meta) {
            changed |= meta.set_tag(value.tag, &value.value)?;
        }

        // a fresh META is written even when empty, so its copies are valid
        if changed || meta.tags().next().is_none() {
            meta.flush_at(dev, offset, size)?;
        }
        Ok(())
    }
}
