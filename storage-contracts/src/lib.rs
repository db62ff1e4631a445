// SPDX-License-Identifier: GPL-3.0-only

//! Contracts between the volume engine and the system it drives.
//!
//! The engine only talks to devices through the traits in [`traits`], so the
//! phase machine can run against in-memory fakes in tests.

pub mod protocol;
pub mod traits;

pub use protocol::{ErrorKind, ResultExt, VolumeError, VolumeResult};
pub use traits::{
    Allocation, DeviceProbe, DeviceProber, DeviceScanner, DiskCheck, DiskLock, EncryptionProvider,
    FilesystemMaker, FormatOptions, KeyProvider, MetaStore, MountBackend, MountPoint,
    PartitionRequest, PartitionTableBackend, Passphrase, ProbeResult, ProbedPartition,
    RejectReason, TargetSettings,
};
