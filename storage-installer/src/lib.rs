// SPDX-License-Identifier: GPL-3.0-only

//! System disk installer
//!
//! Lays out the boot partitions and META on a disk, or marks an installed
//! disk for upgrade. `STATE` and `EPHEMERAL` are left to the volume engine,
//! which provisions them on first boot.

pub mod error;
pub mod install;
pub mod legacy;
pub mod manifest;
pub mod meta_values;
pub mod preflight;

pub use error::{InstallError, Result};
pub use install::{InstallOptions, Installer, PlacedTarget};
pub use legacy::LegacyManifest;
pub use manifest::{Arch, Manifest, Target};
pub use meta_values::MetaValue;
