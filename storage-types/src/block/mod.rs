// SPDX-License-Identifier: GPL-3.0-only

//! Resources of the `block` namespace.

pub mod device;
pub mod discovery;
pub mod disk;
pub mod mount;
pub mod scrub;
pub mod swap;
pub mod volume;

pub use device::{DeviceResyncSpec, DeviceSpec, DevicesStatusSpec};
pub use discovery::{DiscoveredVolumeSpec, DiscoveryRefreshRequestSpec, DiscoveryRefreshStatusSpec};
pub use disk::{DiskSpec, SymlinkSpec, SystemDiskSpec};
pub use mount::{MountRequestSpec, MountStatusSpec, VolumeMountRequestSpec, VolumeMountStatusSpec};
pub use scrub::FsScrubStatusSpec;
pub use swap::{SwapStatusSpec, ZswapStatusSpec};
pub use volume::{
    DiskSelector, FilesystemSpec, FilesystemType, LocatorSpec, MountSpec, PartitionSpec,
    ProvisioningSpec, SymlinkProvisioningSpec, UserDiskConfigStatusSpec, VolumeConfigSpec,
    VolumeLifecycleSpec, VolumePhase, VolumeStatusSpec, VolumeType,
};
