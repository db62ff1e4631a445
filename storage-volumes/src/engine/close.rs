// SPDX-License-Identifier: GPL-3.0-only

use storage_contracts::{ResultExt, VolumeResult};
use storage_types::constants::encrypted_mapper_name;
use storage_types::VolumePhase;
use tracing::info;

use super::VolumeContext;

pub(super) fn close(ctx: &mut VolumeContext<'_>) -> VolumeResult<()> {
    if !ctx.status.encryption_provider.is_empty() && !ctx.status.location.is_empty() {
        let mapped_name = encrypted_mapper_name(&ctx.status.location);

        ctx.backends
            .encryption
            .close(&mapped_name)
            .context(format!("error closing {}", mapped_name))?;

        info!("volume {} closed {}", ctx.id, mapped_name);
        ctx.status.encryption_provider.clear();
        ctx.status.mount_location.clear();
    }

    ctx.status.phase = VolumePhase::Closed;
    Ok(())
}
