// SPDX-License-Identifier: GPL-3.0-only

pub mod discovery;
pub mod filesystem;
pub mod key;
pub mod luks;
pub mod meta;
pub mod mount;
pub mod partition;

pub use discovery::{DeviceProbe, DeviceProber, DeviceScanner, ProbeResult, ProbedPartition};
pub use filesystem::{FilesystemMaker, FormatOptions};
pub use key::{KeyProvider, Passphrase};
pub use luks::EncryptionProvider;
pub use meta::MetaStore;
pub use mount::{MountBackend, MountPoint, TargetSettings};
pub use partition::{Allocation, DiskCheck, DiskLock, PartitionRequest, PartitionTableBackend, RejectReason};
