// SPDX-License-Identifier: GPL-3.0-only

use storage_contracts::{ResultExt, VolumeResult};
use storage_types::{VolumePhase, VolumeType};
use tracing::info;

use super::VolumeContext;

/// Grow a located partition into the free space following it.
///
/// The filesystem inside is grown later, once it is known to match.
pub(super) fn grow(ctx: &mut VolumeContext<'_>) -> VolumeResult<()> {
    let partition = &ctx.config.provisioning.partition_spec;

    if ctx.config.volume_type != VolumeType::Partition
        || !partition.grow
        || ctx.status.parent_location.is_empty()
        || ctx.status.partition_index == 0
    {
        ctx.status.phase = VolumePhase::Provisioned;
        return Ok(());
    }

    let disk_size = ctx
        .disk_by_path(&ctx.status.parent_location)
        .map(|disk| disk.spec.size)
        .unwrap_or_default();
    let max_size = partition.resolved_max_size(disk_size);

    let grown = ctx
        .backends
        .partitions
        .grow(&ctx.status.parent_location, ctx.status.partition_index, max_size)
        .context(format!("error growing partition {}", ctx.status.location))?;

    if let Some(size) = grown {
        info!(
            "volume {} partition {} grown from {} to {} bytes",
            ctx.id, ctx.status.location, ctx.status.size, size
        );
        ctx.status.size = size;
    }

    ctx.status.phase = VolumePhase::Provisioned;
    Ok(())
}
