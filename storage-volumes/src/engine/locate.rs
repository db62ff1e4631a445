// SPDX-License-Identifier: GPL-3.0-only

use storage_contracts::{DiskCheck, PartitionRequest, ResultExt, VolumeError, VolumeResult};
use storage_expr::{Activation, Expression};
use storage_types::{
    DiscoveredVolumeSpec, DiskSpec, FilesystemType, LocatorSpec, Resource, VolumePhase, VolumeType,
};
use tracing::{debug, info};

use super::VolumeContext;

/// Bindings for a disk-scoped expression.
pub fn disk_activation(disk: &DiskSpec, system_disk: bool) -> Activation {
    Activation::new()
        .with("disk", disk.expr_value())
        .with("system_disk", system_disk)
}

pub(super) fn locate_and_provision(ctx: &mut VolumeContext<'_>) -> VolumeResult<()> {
    let config = ctx.config;

    match config.volume_type {
        VolumeType::Tmpfs | VolumeType::Directory | VolumeType::Symlink | VolumeType::Overlay => {
            ctx.status.phase = VolumePhase::Ready;
            return Ok(());
        }
        VolumeType::External => {
            ctx.status.phase = VolumePhase::Ready;
            ctx.status.location = config.provisioning.disk_selector.external.clone();
            ctx.status.mount_location = ctx.status.location.clone();
            ctx.status.filesystem = config.provisioning.filesystem_spec.filesystem_type;
            return Ok(());
        }
        VolumeType::Partition | VolumeType::Disk => {}
    }

    if config.locator.is_zero() {
        return Err(VolumeError::config("volume locator is not set"));
    }

    let located = match &config.locator {
        LocatorSpec::Match(expression) => locate_volume(ctx, expression)?,
        LocatorSpec::DiskMatch(expression) => {
            if config.volume_type != VolumeType::Disk {
                return Err(VolumeError::config(
                    "DiskMatch locator is only valid for disk volumes",
                ));
            }
            locate_disk(ctx, expression)?
        }
        LocatorSpec::None => None,
    };

    if let Some(volume) = located {
        apply_located(ctx, &volume);
        return Ok(());
    }

    if !ctx.devices_ready {
        // keep waiting, more volumes might show up
        return Ok(());
    }

    if config.provisioning.is_zero() {
        ctx.status.phase = VolumePhase::Missing;
        return Ok(());
    }

    if !ctx.previous_wave_provisioned {
        return Ok(());
    }

    provision(ctx)
}

/// Resolve the disk a discovered volume lives on.
fn disk_of<'a>(
    ctx: &'a VolumeContext<'_>,
    volume: &DiscoveredVolumeSpec,
) -> Option<&'a Resource<DiskSpec>> {
    let path = if volume.parent_dev_path.is_empty() {
        &volume.dev_path
    } else {
        &volume.parent_dev_path
    };
    ctx.disk_by_path(path)
}

fn locate_volume(
    ctx: &VolumeContext<'_>,
    expression: &Expression,
) -> VolumeResult<Option<DiscoveredVolumeSpec>> {
    for volume in ctx.discovered {
        let (disk, system_disk) = match disk_of(ctx, &volume.spec) {
            Some(disk) => (disk.spec.expr_value(), ctx.is_system_disk(disk.id())),
            None => (DiskSpec::default().expr_value(), false),
        };

        let activation = Activation::new()
            .with("volume", volume.spec.expr_value())
            .with("disk", disk)
            .with("system_disk", system_disk);

        let matched = expression.eval_bool(&activation).map_err(|err| {
            VolumeError::config(format!("error evaluating volume locator: {}", err))
        })?;

        if matched {
            return Ok(Some(volume.spec.clone()));
        }
    }

    Ok(None)
}

fn matching_disks<'a>(
    ctx: &'a VolumeContext<'_>,
    expression: &Expression,
    what: &str,
) -> VolumeResult<Vec<&'a Resource<DiskSpec>>> {
    let mut matched = Vec::new();

    for disk in ctx.disks {
        if disk.spec.readonly {
            continue;
        }

        let activation = disk_activation(&disk.spec, ctx.is_system_disk(disk.id()));
        let hit = expression
            .eval_bool(&activation)
            .map_err(|err| VolumeError::config(format!("error evaluating {}: {}", what, err)))?;

        if hit {
            matched.push(disk);
        }
    }

    Ok(matched)
}

fn locate_disk(
    ctx: &VolumeContext<'_>,
    expression: &Expression,
) -> VolumeResult<Option<DiscoveredVolumeSpec>> {
    let matched = matching_disks(ctx, expression, "disk locator")?;

    match matched.as_slice() {
        [] => Ok(None),
        [disk] => Ok(ctx
            .discovered
            .iter()
            .find(|volume| volume.spec.dev_path == disk.spec.dev_path && volume.spec.parent_dev_path.is_empty())
            .map(|volume| volume.spec.clone())),
        _ => Err(VolumeError::config(
            "multiple disks matched locator for disk volume",
        )),
    }
}

fn apply_located(ctx: &mut VolumeContext<'_>, volume: &DiscoveredVolumeSpec) {
    let status = &mut *ctx.status;

    status.phase = VolumePhase::Located;
    status.location = volume.dev_path.clone();
    status.parent_location = volume.parent_dev_path.clone();
    status.partition_index = volume.partition_index;
    status.size = volume.size;
    status.uuid = volume.uuid.clone();
    status.partition_uuid = volume.partition_uuid.clone();
    status.filesystem = FilesystemType::from_probe(&volume.name).unwrap_or_default();
}

fn provision(ctx: &mut VolumeContext<'_>) -> VolumeResult<()> {
    let config = ctx.config;
    let selector = &config.provisioning.disk_selector.match_expr;

    if selector.is_zero() {
        return Err(VolumeError::config("disk selector is not set"));
    }

    let matched = matching_disks(ctx, selector, "disk selector")?;

    if matched.is_empty() {
        return Err(VolumeError::retryable("no disks matched selector for volume"));
    }

    if config.volume_type == VolumeType::Disk && matched.len() > 1 {
        return Err(VolumeError::config(
            "multiple disks matched locator for disk volume",
        ));
    }

    let min_size = config.provisioning.partition_spec.min_size;
    let mut rejected = Vec::new();
    let mut picked = None;

    for disk in matched {
        match ctx
            .backends
            .partitions
            .check_disk(&disk.spec.dev_path, config.volume_type, min_size)
        {
            Ok(DiskCheck::Fits) => {
                picked = Some(disk.clone());
                break;
            }
            Ok(DiskCheck::Rejected(reason)) => {
                debug!("disk {} rejected for volume {}: {}", disk.spec.dev_path, ctx.id, reason);
                rejected.push(format!("{}: {}", disk.spec.dev_path, reason));
            }
            Err(err) => {
                debug!("disk {} check failed for volume {}: {}", disk.spec.dev_path, ctx.id, err);
                rejected.push(format!("{}: {}", disk.spec.dev_path, err));
            }
        }
    }

    let Some(disk) = picked else {
        return Err(VolumeError::retryable(format!(
            "no disks matched for volume: {}",
            rejected.join("; ")
        )));
    };

    if config.volume_type == VolumeType::Disk {
        ctx.status.phase = VolumePhase::Provisioned;
        ctx.status.location = disk.spec.dev_path.clone();
        ctx.status.parent_location = String::new();
        ctx.status.size = disk.spec.size;

        info!("volume {} provisioned on disk {}", ctx.id, disk.spec.dev_path);
        return Ok(());
    }

    let partition = &config.provisioning.partition_spec;
    let request = PartitionRequest {
        min_size: partition.min_size,
        max_size: partition.resolved_max_size(disk.spec.size),
        label: partition.label.clone(),
        type_uuid: partition.type_uuid.clone(),
    };

    let allocation = ctx
        .backends
        .partitions
        .allocate(&disk.spec.dev_path, &request)
        .context(format!("error provisioning partition on {}", disk.spec.dev_path))?;

    let status = &mut *ctx.status;
    status.phase = VolumePhase::Provisioned;
    status.location = allocation.dev_path.clone();
    status.parent_location = disk.spec.dev_path.clone();
    status.partition_index = allocation.partition_index;
    status.partition_uuid = allocation.partition_uuid.clone();
    status.size = allocation.size;

    info!(
        "volume {} provisioned as partition {} on {} ({} bytes)",
        ctx.id, allocation.partition_index, disk.spec.dev_path, allocation.size
    );
    Ok(())
}
