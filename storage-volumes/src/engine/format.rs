// SPDX-License-Identifier: GPL-3.0-only

use storage_contracts::{FormatOptions, ResultExt, VolumeError, VolumeResult};
use storage_types::{FilesystemType, VolumePhase};
use tracing::info;

use super::VolumeContext;

/// Make sure the mount location carries the configured filesystem.
///
/// A blank device is formatted. A matching filesystem is grown when the
/// volume grows, anything else is left alone and fails the volume.
pub(super) fn format(ctx: &mut VolumeContext<'_>) -> VolumeResult<()> {
    let spec = &ctx.config.provisioning.filesystem_spec;
    let target = ctx.status.mount_location.clone();
    let _lock = ctx.lock_parent()?;

    let probe = ctx
        .backends
        .prober
        .probe(&target)
        .context(format!("error probing {}", target))?;
    let found = FilesystemType::from_probe(&probe.name);

    if spec.filesystem_type == FilesystemType::None {
        ctx.status.filesystem = found.unwrap_or_default();
        ctx.status.phase = VolumePhase::Ready;
        return Ok(());
    }

    if probe.is_empty() {
        let options = FormatOptions {
            filesystem: spec.filesystem_type,
            label: spec.label.clone(),
            project_quota: ctx.config.mount.project_quota_support,
            discard: false,
        };

        ctx.backends
            .filesystems
            .format(&target, &options)
            .context(format!("error formatting {}", target))?;

        info!("volume {} formatted as {} at {}", ctx.id, spec.filesystem_type, target);

        let formatted = ctx
            .backends
            .prober
            .probe(&target)
            .context(format!("error probing {}", target))?;
        ctx.status.uuid = formatted.uuid;
    } else if found == Some(spec.filesystem_type) {
        ctx.status.uuid = probe.uuid.clone();

        if ctx.config.provisioning.partition_spec.grow {
            ctx.backends
                .filesystems
                .grow(&target, spec.filesystem_type)
                .context(format!("error growing filesystem on {}", target))?;
        }
    } else {
        return Err(VolumeError::fatal(format!(
            "unexpected filesystem type on {}: found {:?}, expected {}",
            target, probe.name, spec.filesystem_type
        )));
    }

    ctx.status.filesystem = spec.filesystem_type;
    ctx.status.phase = VolumePhase::Ready;
    Ok(())
}
