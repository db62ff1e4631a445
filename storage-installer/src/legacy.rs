// SPDX-License-Identifier: GPL-3.0-only

//! The older per-device JSON manifest.
//!
//! ```json
//! {
//!   "Devices": { "/dev/sda": { "ResetPartitionTable": true, "Zero": false } },
//!   "Targets": { "/dev/sda": [
//!     { "Label": "EFI", "PartitionType": "C12A7328-...", "FileSystemType": "vfat", "Size": 104857600 }
//!   ] }
//! }
//! ```
//!
//! Fields the installer does not use (assets, extra preserve sources) are
//! ignored.

use std::collections::BTreeMap;

use serde::Deserialize;
use storage_types::FilesystemType;
use storage_types::partition_types::normalize_type_guid;

use crate::manifest::{Manifest, Target};
use crate::{InstallError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct LegacyDevice {
    pub reset_partition_table: bool,
    pub zero: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct LegacyTarget {
    pub label: String,
    pub partition_type: String,
    pub file_system_type: String,
    #[serde(rename = "LegacyBIOSBootable")]
    pub legacy_bios_bootable: bool,
    pub size: u64,
    pub skip: bool,
    pub preserve_contents: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct LegacyManifest {
    pub devices: BTreeMap<String, LegacyDevice>,
    pub targets: BTreeMap<String, Vec<LegacyTarget>>,
}

/// A legacy manifest narrowed to one disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyPlan {
    pub manifest: Manifest,
    /// Replace whatever is on the disk.
    pub force: bool,
    pub zero: bool,
}

impl LegacyManifest {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn into_plan(mut self, disk: &str) -> Result<LegacyPlan> {
        if let Some(other) = self.targets.keys().find(|dev| *dev != disk) {
            return Err(InstallError::Manifest(format!(
                "targets for {}, but installing to {}",
                other, disk
            )));
        }

        let device = self.devices.remove(disk).unwrap_or_default();
        if device.zero && !device.reset_partition_table {
            return Err(InstallError::Manifest(
                "zero option can't be used without force".into(),
            ));
        }

        let targets = self
            .targets
            .remove(disk)
            .unwrap_or_default()
            .into_iter()
            .map(LegacyTarget::into_target)
            .collect::<Result<Vec<_>>>()?;

        let manifest = Manifest { targets };
        manifest.validate()?;

        Ok(LegacyPlan {
            manifest,
            force: device.reset_partition_table,
            zero: device.zero,
        })
    }
}

impl LegacyTarget {
    fn into_target(self) -> Result<Target> {
        let no_filesystem = self.file_system_type == "none";
        let filesystem = if no_filesystem {
            FilesystemType::None
        } else {
            self.file_system_type
                .parse::<FilesystemType>()
                .map_err(|err| InstallError::Manifest(format!("target {}: {}", self.label, err)))?
        };

        Ok(Target {
            label: self.label,
            partition_type: normalize_type_guid(&self.partition_type),
            size: self.size,
            filesystem,
            legacy_bios_bootable: self.legacy_bios_bootable,
            preserve_contents: self.skip || self.preserve_contents,
            no_filesystem,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage_types::MIB;
    use storage_types::partition_types::{EFI_SYSTEM, LINUX_FILESYSTEM};

    fn document(zero: bool) -> String {
        format!(
            r#"{{
  "Devices": {{ "/dev/sda": {{ "Device": "/dev/sda", "ResetPartitionTable": true, "Zero": {zero} }} }},
  "Targets": {{ "/dev/sda": [
    {{ "Device": "/dev/sda", "Label": "EFI", "PartitionType": "{efi_type}", "FileSystemType": "vfat", "Size": {efi}, "Force": true }},
    {{ "Device": "/dev/sda", "Label": "META", "PartitionType": "{LINUX_FILESYSTEM}", "FileSystemType": "none", "Size": {meta}, "Skip": true, "Assets": [] }}
  ] }}
}}"#,
            efi_type = EFI_SYSTEM.to_lowercase(),
            efi = 100 * MIB,
            meta = MIB,
        )
    }

    #[test]
    fn adapts_to_the_current_manifest() {
        let plan = LegacyManifest::from_json(&document(true))
            .unwrap()
            .into_plan("/dev/sda")
            .unwrap();

        assert!(plan.force);
        assert!(plan.zero);

        let efi = plan.manifest.target("EFI").unwrap();
        assert_eq!(efi.filesystem, FilesystemType::Vfat);
        assert!(!efi.no_filesystem);
        assert!(!efi.preserve_contents);
        assert_eq!(efi.partition_type, EFI_SYSTEM);

        let meta = plan.manifest.target("META").unwrap();
        assert!(meta.no_filesystem);
        assert!(meta.preserve_contents);
        assert_eq!(meta.size, MIB);
    }

    #[test]
    fn zero_requires_reset() {
        let text = document(true).replace(r#""ResetPartitionTable": true"#, r#""ResetPartitionTable": false"#);
        let err = LegacyManifest::from_json(&text)
            .unwrap()
            .into_plan("/dev/sda")
            .unwrap_err();
        assert!(err.to_string().contains("zero option can't be used without force"), "{}", err);
    }

    #[test]
    fn targets_must_belong_to_the_disk() {
        let err = LegacyManifest::from_json(&document(false))
            .unwrap()
            .into_plan("/dev/vda")
            .unwrap_err();
        assert!(matches!(err, InstallError::Manifest(_)), "{}", err);

        assert!(matches!(
            LegacyManifest::from_json("{ \"Targets\": [] }"),
            Err(InstallError::LegacyManifest(_))
        ));
    }
}
