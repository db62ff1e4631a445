// SPDX-License-Identifier: GPL-3.0-only

//! The reconcile loops.
//!
//! Each controller owns its outputs and reacts to writes of its inputs:
//!
//! ```text
//! Devices -> Discovery -> Disks / Symlinks / SystemDisk
//!         -> VolumeConfig -> VolumeManager -> MountRequest -> Mount -> MountStatus
//! ```
//!
//! Every controller exposes its reconcile pass as a plain method so tests can
//! drive it without a running runtime.

pub mod devices;
pub mod devices_status;
pub mod discovery;
pub mod disks;
pub mod fs_scrub;
pub mod lvm;
pub mod mount;
pub mod mount_request;
pub mod mount_status;
pub mod swap_status;
pub mod symlinks;
pub mod system_disk;
pub mod volume_config;
pub mod volume_manager;
pub mod zswap;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use storage_runtime::Runtime;
use storage_sys::sysfs::Sysfs;
use tracing::debug;

use crate::backends::Backends;
use crate::config::MachineConfig;

pub use devices::DevicesController;
pub use devices_status::DevicesStatusController;
pub use discovery::DiscoveryController;
pub use disks::DisksController;
pub use fs_scrub::FsScrubController;
pub use lvm::LvmActivationController;
pub use mount::MountController;
pub use mount_request::MountRequestController;
pub use mount_status::MountStatusController;
pub use swap_status::SwapStatusController;
pub use symlinks::SymlinksController;
pub use system_disk::SystemDiskController;
pub use volume_config::VolumeConfigController;
pub use volume_manager::VolumeManagerController;
pub use zswap::ZswapController;

/// Knobs shared by the controllers.
#[derive(Debug, Clone)]
pub struct Settings {
    /// `None` when the machine carries no configuration document.
    pub machine: Option<MachineConfig>,
    /// STATE and EPHEMERAL become plain directories.
    pub in_container: bool,
    pub sysfs_root: PathBuf,
    pub dev_root: String,
    pub watch_kernel: bool,
    /// Devices count as settled after this long even if events keep coming.
    pub udev_settle_timeout: Duration,
    /// Where to write a JSON snapshot of volume and mount statuses.
    pub status_dump: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            machine: None,
            in_container: false,
            sysfs_root: PathBuf::from("/sys"),
            dev_root: "/dev".to_string(),
            watch_kernel: true,
            udev_settle_timeout: Duration::from_secs(30),
            status_dump: None,
        }
    }
}

/// Register every controller with `runtime`.
pub fn register_all(runtime: &mut Runtime, backends: Backends, settings: Settings) -> anyhow::Result<()> {
    let sysfs = Sysfs::new(&settings.sysfs_root);

    runtime
        .register(Box::new(DevicesController::new(
            sysfs.clone(),
            settings.dev_root.clone(),
            settings.watch_kernel,
        )))
        .context("failed to register devices controller")?;
    runtime.register(Box::new(DevicesStatusController::new(settings.udev_settle_timeout)))?;
    runtime.register(Box::new(DiscoveryController::new(
        backends.clone(),
        settings.dev_root.clone(),
    )))?;
    runtime.register(Box::new(DisksController::new(sysfs, settings.dev_root.clone())))?;
    runtime.register(Box::new(SymlinksController::new()))?;
    runtime.register(Box::new(SystemDiskController::new()))?;
    runtime.register(Box::new(VolumeConfigController::new(
        backends.clone(),
        settings.machine.clone(),
        settings.in_container,
    )))?;

    let mut manager = VolumeManagerController::new(backends.clone());
    if let Some(path) = &settings.status_dump {
        manager = manager.with_status_dump(path.clone());
    }
    runtime.register(Box::new(manager))?;

    runtime.register(Box::new(MountRequestController::new()))?;
    runtime.register(Box::new(MountController::new(backends.clone())))?;
    runtime.register(Box::new(MountStatusController::new()))?;
    runtime.register(Box::new(SwapStatusController::new()))?;

    let zswap = settings.machine.as_ref().and_then(|machine| machine.zswap.clone());
    runtime.register(Box::new(ZswapController::new(zswap)))?;

    if cfg!(feature = "lvm-tools") {
        runtime.register(Box::new(LvmActivationController::new(backends.runner.clone())))?;
    }

    let scrubs = settings
        .machine
        .as_ref()
        .map(|machine| machine.fs_scrub.clone())
        .unwrap_or_default();
    if cfg!(feature = "fs-xfs") && !scrubs.is_empty() {
        runtime.register(Box::new(FsScrubController::new(backends.runner.clone(), scrubs)))?;
    }

    debug!("controllers registered");
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use storage_testing::{FakeHost, RecordingRunner};

    use crate::backends::Backends;
    use crate::keys::LocalKeys;

    pub const NODE_UUID: &str = "4c4c4544-0039-3010-8048-b7c04f334c32";

    pub fn backends(host: &Arc<FakeHost>) -> Backends {
        Backends::from_host(
            host.clone(),
            Arc::new(LocalKeys::new(NODE_UUID)),
            Arc::new(RecordingRunner::new()),
        )
    }

    pub fn backends_with_runner(host: &Arc<FakeHost>, runner: &Arc<RecordingRunner>) -> Backends {
        Backends::from_host(host.clone(), Arc::new(LocalKeys::new(NODE_UUID)), runner.clone())
    }
}
