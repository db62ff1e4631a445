// SPDX-License-Identifier: GPL-3.0-only

use std::collections::BTreeSet;

use storage_contracts::{Passphrase, ResultExt, VolumeError, VolumeResult};
use storage_types::constants::encrypted_mapper_name;
use storage_types::{EncryptionKey, EncryptionSpec, VolumePhase};
use tracing::{debug, info, warn};

use super::VolumeContext;

const LUKS: &str = "luks";

pub(super) fn handle_encryption(ctx: &mut VolumeContext<'_>) -> VolumeResult<()> {
    let spec = &ctx.config.encryption;

    if !spec.is_enabled() {
        ctx.status.mount_location = ctx.status.location.clone();
        ctx.status.encryption_provider = String::new();
        ctx.status.encryption_failed_syncs.clear();
        ctx.status.phase = VolumePhase::Prepared;
        return Ok(());
    }

    if spec.keys.is_empty() {
        return Err(VolumeError::config("encryption requires at least one key"));
    }

    let _lock = ctx.lock_parent()?;

    let location = ctx.status.location.clone();
    let probe = ctx
        .backends
        .prober
        .probe(&location)
        .context(format!("error probing {}", location))?;

    match probe.name.as_str() {
        "" => format_device(ctx, spec, &location)?,
        LUKS => {}
        other => {
            return Err(VolumeError::fatal(format!(
                "volume at {} has unexpected type {:?}, expected {}",
                location, other, LUKS
            )));
        }
    }

    let mapped_name = encrypted_mapper_name(&location);
    let (opened_with, mapped_path) = open_device(ctx, spec, &location, &mapped_name)?;

    ctx.status.encryption_failed_syncs = sync_keys(ctx, spec, &location, &opened_with)?;
    ctx.status.mount_location = mapped_path;
    ctx.status.encryption_provider = spec.provider.to_string();
    ctx.status.phase = VolumePhase::Prepared;

    Ok(())
}

fn passphrase(ctx: &VolumeContext<'_>, key: &EncryptionKey) -> VolumeResult<Passphrase> {
    ctx.backends
        .keys
        .passphrase(key, ctx.id)
        .context(format!("key slot {}", key.slot))
}

fn format_device(ctx: &VolumeContext<'_>, spec: &EncryptionSpec, location: &str) -> VolumeResult<()> {
    // keys are sorted by slot; the rest are added by the key sync
    let Some(first) = spec.keys.first() else {
        return Err(VolumeError::config("encryption requires at least one key"));
    };

    let key = passphrase(ctx, first)?;
    ctx.backends
        .encryption
        .format(location, spec, first.slot, &key)
        .context(format!("error encrypting {}", location))?;

    info!("volume {} encrypted at {} (slot {})", ctx.id, location, first.slot);
    Ok(())
}

/// Try the configured keys in slot order until one opens the device.
fn open_device(
    ctx: &VolumeContext<'_>,
    spec: &EncryptionSpec,
    location: &str,
    mapped_name: &str,
) -> VolumeResult<(Passphrase, String)> {
    let mut last_error = None;

    for key in &spec.keys {
        let passphrase = match passphrase(ctx, key) {
            Ok(passphrase) => passphrase,
            Err(err) => {
                debug!("volume {}: {}", ctx.id, err);
                last_error = Some(err);
                continue;
            }
        };

        match ctx.backends.encryption.open(location, mapped_name, spec, &passphrase) {
            Ok(path) => {
                debug!("volume {} opened with key slot {}", ctx.id, key.slot);
                return Ok((passphrase, path));
            }
            Err(err) => {
                debug!("volume {}: key slot {} failed to open {}: {}", ctx.id, key.slot, location, err);
                last_error = Some(err.context(format!("key slot {}", key.slot)));
            }
        }
    }

    let err = last_error.unwrap_or_else(|| VolumeError::config("encryption requires at least one key"));
    Err(err.context(format!("failed to open encrypted volume {}", location)))
}

/// Bring the key slots in line with the configured keys.
///
/// Returns the slots that could not be synced; those do not fail the volume.
fn sync_keys(
    ctx: &VolumeContext<'_>,
    spec: &EncryptionSpec,
    location: &str,
    opened_with: &Passphrase,
) -> VolumeResult<Vec<String>> {
    let encryption = &ctx.backends.encryption;
    let mut occupied: BTreeSet<u32> = encryption
        .read_keyslots(location)
        .context(format!("error reading key slots of {}", location))?
        .into_iter()
        .collect();

    let mut failed = Vec::new();
    let mut record = |slot: u32, err: VolumeError| {
        warn!("volume {}: failed to sync key slot {}: {}", ctx.id, slot, err);
        failed.push(format!("slot {}: {}", slot, err));
    };

    // additions go first so replacements and removals below can check that
    // another slot still opens the device
    let mut mismatched = Vec::new();
    for key in &spec.keys {
        let wanted = match passphrase(ctx, key) {
            Ok(passphrase) => passphrase,
            Err(err) => {
                record(key.slot, err);
                continue;
            }
        };

        if !occupied.contains(&key.slot) {
            match encryption.add_key(location, opened_with, key.slot, &wanted) {
                Ok(()) => {
                    info!("volume {}: added key slot {}", ctx.id, key.slot);
                    occupied.insert(key.slot);
                }
                Err(err) => record(key.slot, err),
            }
            continue;
        }

        match encryption.check_key(location, key.slot, &wanted) {
            Ok(true) => {}
            Ok(false) => mismatched.push((key.slot, wanted)),
            Err(err) => record(key.slot, err),
        }
    }

    let opens_elsewhere = |slot: u32, occupied: &BTreeSet<u32>| {
        occupied
            .iter()
            .filter(|other| **other != slot)
            .any(|other| matches!(encryption.check_key(location, *other, opened_with), Ok(true)))
    };

    for (slot, wanted) in mismatched {
        if !opens_elsewhere(slot, &occupied) {
            record(slot, VolumeError::retryable("slot holds the only key that opens the device"));
            continue;
        }

        let replaced = encryption
            .remove_key(location, slot, opened_with)
            .and_then(|()| encryption.add_key(location, opened_with, slot, &wanted));
        match replaced {
            Ok(()) => info!("volume {}: replaced key slot {}", ctx.id, slot),
            Err(err) => record(slot, err),
        }
    }

    let configured: BTreeSet<u32> = spec.keys.iter().map(|key| key.slot).collect();
    let stale: Vec<u32> = occupied.difference(&configured).copied().collect();
    for slot in stale {
        if !opens_elsewhere(slot, &occupied) {
            record(slot, VolumeError::retryable("slot holds the only key that opens the device"));
            continue;
        }

        match encryption.remove_key(location, slot, opened_with) {
            Ok(()) => {
                info!("volume {}: removed stale key slot {}", ctx.id, slot);
                occupied.remove(&slot);
            }
            Err(err) => record(slot, err),
        }
    }

    Ok(failed)
}
