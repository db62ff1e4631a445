// SPDX-License-Identifier: GPL-3.0-only

//! The per-volume phase machine.
//!
//! One call to [`process`] steps a volume through as many phases as it can
//! in a single pass:
//!
//! ```text
//! Waiting/Missing --locate/provision--> Located | Provisioned
//! Located --grow--> Provisioned --encrypt--> Prepared --format--> Ready
//! ```
//!
//! While closing every phase heads to `Closed`, closing the encrypted
//! mapping on the way when there is one. A failed volume restarts from the
//! phase it failed in.

mod close;
mod encrypt;
mod format;
mod grow;
mod locate;

use std::cmp::Ordering;

use storage_contracts::{DiskLock, ResultExt, VolumeResult};
use storage_types::{
    DiscoveredVolumeSpec, DiskSpec, Resource, VolumeConfigSpec, VolumePhase, VolumeStatusSpec,
};

use crate::backends::Backends;

pub use locate::disk_activation;

/// Everything one volume pass may look at.
pub struct VolumeContext<'a> {
    pub id: &'a str,
    pub config: &'a VolumeConfigSpec,
    pub status: &'a mut VolumeStatusSpec,
    pub discovered: &'a [Resource<DiscoveredVolumeSpec>],
    pub disks: &'a [Resource<DiskSpec>],
    /// Id of the disk carrying META, when known.
    pub system_disk: Option<&'a str>,
    pub devices_ready: bool,
    pub previous_wave_provisioned: bool,
    pub backends: &'a Backends,
}

impl VolumeContext<'_> {
    fn disk_by_id(&self, id: &str) -> Option<&Resource<DiskSpec>> {
        self.disks.iter().find(|disk| disk.id() == id)
    }

    fn disk_by_path(&self, dev_path: &str) -> Option<&Resource<DiskSpec>> {
        self.disks.iter().find(|disk| disk.spec.dev_path == dev_path)
    }

    fn is_system_disk(&self, disk_id: &str) -> bool {
        self.system_disk == Some(disk_id)
    }

    /// Hold the disk the volume lives on until the guard drops.
    ///
    /// Whole-disk volumes have no parent and are not locked.
    fn lock_parent(&self) -> VolumeResult<Option<DiskLock>> {
        let parent = &self.status.parent_location;
        if parent.is_empty() || *parent == self.status.location {
            return Ok(None);
        }

        self.backends
            .partitions
            .lock_disk(parent)
            .context(format!("error locking {}", parent))
            .map(Some)
    }
}

/// Step the volume until its phase stops changing.
pub fn process(ctx: &mut VolumeContext<'_>, closing: bool) -> VolumeResult<()> {
    loop {
        let before = ctx.status.phase;

        if closing {
            close_step(ctx)?;
        } else {
            step(ctx)?;
        }

        if ctx.status.phase == before {
            return Ok(());
        }
    }
}

fn step(ctx: &mut VolumeContext<'_>) -> VolumeResult<()> {
    match ctx.status.phase {
        VolumePhase::Waiting | VolumePhase::Missing => locate::locate_and_provision(ctx),
        VolumePhase::Located => grow::grow(ctx),
        VolumePhase::Provisioned => encrypt::handle_encryption(ctx),
        VolumePhase::Prepared => format::format(ctx),
        VolumePhase::Failed => {
            ctx.status.phase = ctx.status.pre_fail_phase;
            Ok(())
        }
        VolumePhase::Ready | VolumePhase::Closed => Ok(()),
    }
}

fn close_step(ctx: &mut VolumeContext<'_>) -> VolumeResult<()> {
    match ctx.status.phase {
        VolumePhase::Ready | VolumePhase::Prepared => close::close(ctx),
        VolumePhase::Waiting
        | VolumePhase::Missing
        | VolumePhase::Located
        | VolumePhase::Provisioned => {
            ctx.status.phase = VolumePhase::Closed;
            Ok(())
        }
        VolumePhase::Failed => {
            ctx.status.phase = ctx.status.pre_fail_phase;
            Ok(())
        }
        VolumePhase::Closed => Ok(()),
    }
}

/// Processing order: lower waves first, and within a wave the growing
/// volumes last so fixed-size partitions are allocated before them.
pub fn compare_volume_configs(a: &VolumeConfigSpec, b: &VolumeConfigSpec) -> Ordering {
    let key = |spec: &VolumeConfigSpec| {
        (
            spec.provisioning.wave,
            spec.provisioning.partition_spec.grow,
        )
    };
    key(a).cmp(&key(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage_types::{PartitionSpec, ProvisioningSpec};

    fn config(wave: i32, grow: bool) -> VolumeConfigSpec {
        VolumeConfigSpec {
            provisioning: ProvisioningSpec {
                wave,
                partition_spec: PartitionSpec {
                    grow,
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn growing_volumes_sort_last_within_a_wave() {
        let mut configs = vec![
            ("EPHEMERAL", config(-1, true)),
            ("u-data", config(0, false)),
            ("STATE", config(-1, false)),
            ("legacy", config(1_000_000, false)),
            ("u-grow", config(0, true)),
        ];
        configs.sort_by(|a, b| compare_volume_configs(&a.1, &b.1));

        let order: Vec<&str> = configs.iter().map(|(id, _)| *id).collect();
        assert_eq!(order, ["STATE", "EPHEMERAL", "u-data", "u-grow", "legacy"]);
    }
}
