// SPDX-License-Identifier: GPL-3.0-only

//! What goes on the disk, partition by partition.

use std::fmt;

use serde::Serialize;
use storage_types::constants::{META_PARTITION_LABEL, META_SIZE};
use storage_types::partition_types::{BIOS_BOOT, EFI_SYSTEM, LINUX_FILESYSTEM};
use storage_types::{FilesystemType, MIB};
use uuid::Uuid;

use crate::{InstallError, Result};

pub const EFI_PARTITION_LABEL: &str = "EFI";
pub const BIOS_PARTITION_LABEL: &str = "BIOS";
pub const BOOT_PARTITION_LABEL: &str = "BOOT";

pub const EFI_SIZE: u64 = 100 * MIB;
pub const BIOS_GRUB_SIZE: u64 = MIB;
pub const BOOT_SIZE: u64 = 1000 * MIB;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Amd64,
    Arm64,
}

impl Arch {
    /// The architecture this binary was built for.
    pub const fn host() -> Self {
        if cfg!(target_arch = "aarch64") {
            Arch::Arm64
        } else {
            Arch::Amd64
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    pub label: String,
    /// GPT partition type GUID.
    pub partition_type: String,
    /// Bytes; zero takes the rest of the disk.
    pub size: u64,
    pub filesystem: FilesystemType,
    pub legacy_bios_bootable: bool,
    /// Carry the partition contents over from the previous layout.
    pub preserve_contents: bool,
    /// Leave the partition unformatted.
    pub no_filesystem: bool,
}

impl Target {
    fn new(label: &str, partition_type: &str, size: u64, filesystem: FilesystemType) -> Self {
        Self {
            label: label.to_string(),
            partition_type: partition_type.to_string(),
            size,
            filesystem,
            legacy_bios_bootable: false,
            preserve_contents: false,
            no_filesystem: filesystem == FilesystemType::None,
        }
    }

    pub fn type_guid(&self) -> Result<Uuid> {
        Uuid::parse_str(&self.partition_type).map_err(|err| {
            InstallError::Manifest(format!(
                "partition type {:?} of {}: {}",
                self.partition_type, self.label, err
            ))
        })
    }

    pub fn needs_format(&self) -> bool {
        !self.no_filesystem && self.filesystem != FilesystemType::None
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Manifest {
    pub targets: Vec<Target>,
}

impl Manifest {
    /// The boot layout: EFI, BIOS boot on amd64, BOOT and META.
    pub fn install_plan(arch: Arch) -> Self {
        let mut targets = vec![Target::new(
            EFI_PARTITION_LABEL,
            EFI_SYSTEM,
            EFI_SIZE,
            FilesystemType::Vfat,
        )];

        if arch == Arch::Amd64 {
            let mut bios = Target::new(BIOS_PARTITION_LABEL, BIOS_BOOT, BIOS_GRUB_SIZE, FilesystemType::None);
            bios.legacy_bios_bootable = true;
            targets.push(bios);
        }

        targets.push(Target::new(
            BOOT_PARTITION_LABEL,
            LINUX_FILESYSTEM,
            BOOT_SIZE,
            FilesystemType::Xfs,
        ));
        targets.push(Target::new(
            META_PARTITION_LABEL,
            LINUX_FILESYSTEM,
            META_SIZE,
            FilesystemType::None,
        ));

        Self { targets }
    }

    pub fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(InstallError::Manifest("no targets".into()));
        }

        for (i, target) in self.targets.iter().enumerate() {
            if target.label.is_empty() {
                return Err(InstallError::Manifest(format!("target {} has no label", i)));
            }
            target.type_guid()?;

            if self.targets[..i].iter().any(|other| other.label == target.label) {
                return Err(InstallError::Manifest(format!("duplicate label {}", target.label)));
            }
            if target.size == 0 && i + 1 != self.targets.len() {
                return Err(InstallError::Manifest(format!(
                    "only the last target may fill the disk, {} is not last",
                    target.label
                )));
            }
        }

        if self.target(META_PARTITION_LABEL).is_none() {
            return Err(InstallError::Manifest(format!("no {} target", META_PARTITION_LABEL)));
        }

        Ok(())
    }

    pub fn target(&self, label: &str) -> Option<&Target> {
        self.targets.iter().find(|target| target.label == label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(manifest: &Manifest) -> Vec<&str> {
        manifest.targets.iter().map(|target| target.label.as_str()).collect()
    }

    #[test]
    fn amd64_plan_boots_from_bios_too() {
        let plan = Manifest::install_plan(Arch::Amd64);
        assert_eq!(labels(&plan), ["EFI", "BIOS", "BOOT", "META"]);
        plan.validate().unwrap();

        let bios = plan.target("BIOS").unwrap();
        assert!(bios.legacy_bios_bootable);
        assert!(!bios.needs_format());
        assert_eq!(bios.size, MIB);

        let efi = plan.target("EFI").unwrap();
        assert_eq!(efi.filesystem, FilesystemType::Vfat);
        assert_eq!(efi.size, 100 * MIB);
        assert!(efi.needs_format());

        assert_eq!(plan.target("BOOT").unwrap().filesystem, FilesystemType::Xfs);
        assert!(!plan.target("META").unwrap().needs_format());
    }

    #[test]
    fn arm64_plan_has_no_bios_partition() {
        let plan = Manifest::install_plan(Arch::Arm64);
        assert_eq!(labels(&plan), ["EFI", "BOOT", "META"]);
    }

    #[test]
    fn validation() {
        let mut manifest = Manifest::install_plan(Arch::Arm64);
        manifest.targets[0].size = 0;
        assert!(matches!(manifest.validate(), Err(InstallError::Manifest(_))));

        let mut manifest = Manifest::install_plan(Arch::Arm64);
        manifest.targets.pop();
        let err = manifest.validate().unwrap_err();
        assert!(err.to_string().contains("no META target"), "{}", err);

        let mut manifest = Manifest::install_plan(Arch::Arm64);
        manifest.targets[1].partition_type = "boot".into();
        assert!(manifest.validate().is_err());

        let mut manifest = Manifest::install_plan(Arch::Arm64);
        manifest.targets[1].label = "EFI".into();
        assert!(manifest.validate().unwrap_err().to_string().contains("duplicate"));

        assert!(Manifest::default().validate().is_err());
    }
}
