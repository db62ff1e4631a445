// SPDX-License-Identifier: GPL-3.0-only

//! The set of system capabilities the controllers drive.

use std::sync::Arc;

use storage_contracts::{
    DeviceProber, DeviceScanner, EncryptionProvider, FilesystemMaker, KeyProvider, MetaStore,
    MountBackend, PartitionTableBackend,
};
use storage_sys::{
    CommandRunner, GptBackend, Luks2, SystemFilesystemMaker, SystemMeta, SystemMountBackend,
    SystemProber,
};

/// Capabilities shared by every controller.
///
/// Cloning is cheap; every member is reference counted.
#[derive(Clone)]
pub struct Backends {
    pub scanner: Arc<dyn DeviceScanner>,
    pub prober: Arc<dyn DeviceProber>,
    pub partitions: Arc<dyn PartitionTableBackend>,
    pub filesystems: Arc<dyn FilesystemMaker>,
    pub encryption: Arc<dyn EncryptionProvider>,
    pub keys: Arc<dyn KeyProvider>,
    pub meta: Arc<dyn MetaStore>,
    pub mounts: Arc<dyn MountBackend>,
    pub runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}

impl Backends {
    /// Real devices, real tools.
    pub fn system(
        runner: Arc<dyn CommandRunner>,
        keys: Arc<dyn KeyProvider>,
        xfs_config: Option<String>,
    ) -> Self {
        let mut filesystems = SystemFilesystemMaker::new(runner.clone());
        if let Some(path) = xfs_config {
            filesystems = filesystems.with_xfs_config(path);
        }

        Self {
            scanner: Arc::new(SystemProber),
            prober: Arc::new(SystemProber),
            partitions: Arc::new(GptBackend::new()),
            filesystems: Arc::new(filesystems),
            encryption: Arc::new(Luks2::new(runner.clone())),
            keys,
            meta: Arc::new(SystemMeta),
            mounts: Arc::new(SystemMountBackend),
            runner,
        }
    }

    /// Every device capability served by one host implementation.
    pub fn from_host<H>(host: Arc<H>, keys: Arc<dyn KeyProvider>, runner: Arc<dyn CommandRunner>) -> Self
    where
        H: DeviceScanner
            + DeviceProber
            + PartitionTableBackend
            + FilesystemMaker
            + EncryptionProvider
            + MetaStore
            + MountBackend
            + 'static,
    {
        Self {
            scanner: host.clone(),
            prober: host.clone(),
            partitions: host.clone(),
            filesystems: host.clone(),
            encryption: host.clone(),
            keys,
            meta: host.clone(),
            mounts: host,
            runner,
        }
    }
}
