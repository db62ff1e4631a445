// SPDX-License-Identifier: GPL-3.0-only

//! Volumes declared by the operator: user, raw, existing and swap volumes.

use storage_expr::{EnvKind, Expression};
use storage_types::constants::{
    EXISTING_VOLUME_PREFIX, LABEL_EXISTING_VOLUME, LABEL_RAW_VOLUME, LABEL_SWAP_VOLUME,
    LABEL_USER_VOLUME, MIN_USER_VOLUME_SIZE, RAW_VOLUME_PREFIX, SWAP_VOLUME_PREFIX,
    USER_VOLUME_MOUNT_POINT, USER_VOLUME_PREFIX, WAVE_USER_VOLUMES,
};
use storage_types::partition_types::{LINUX_FILESYSTEM, LINUX_SWAP};
use storage_types::{
    DiskSelector, EncryptionSpec, FilesystemSpec, FilesystemType, LocatorSpec, MountSpec,
    PartitionSpec, ProvisioningSpec, VolumeConfigSpec, VolumeType,
};

use super::system::EPHEMERAL_SELINUX_LABEL;
use super::{MountIntent, TransformEnv, VolumeResource, expression, label_match, no_match};
use crate::config::{ConfigError, EncryptionConfig, ProvisioningConfig, Result, UserVolumeType};

fn user_mount(name: &str) -> MountSpec {
    MountSpec {
        target_path: name.to_string(),
        parent_id: USER_VOLUME_MOUNT_POINT.to_string(),
        selinux_label: EPHEMERAL_SELINUX_LABEL.to_string(),
        file_mode: 0o755,
        ..Default::default()
    }
}

fn selector(provisioning: &ProvisioningConfig) -> Result<Expression> {
    match &provisioning.disk_selector {
        Some(source) => expression(source, EnvKind::DiskLocator),
        None => Ok(no_match()),
    }
}

fn encryption(config: Option<&EncryptionConfig>) -> Result<EncryptionSpec> {
    config
        .map(EncryptionConfig::to_spec)
        .transpose()
        .map(Option::unwrap_or_default)
}

/// Provisioning of a partition labelled `id` on a disk picked by the selector.
fn partition_provisioning(
    id: &str,
    provisioning: &ProvisioningConfig,
    type_uuid: &str,
    filesystem_type: FilesystemType,
) -> Result<ProvisioningSpec> {
    let (max_size, relative_max_size) = provisioning.max_size_fields();
    let min_size = provisioning
        .min_size
        .map(|size| size.0)
        .filter(|size| *size != 0)
        .unwrap_or(MIN_USER_VOLUME_SIZE);

    if max_size != 0 && max_size < min_size {
        return Err(ConfigError::Invalid(format!(
            "volume {:?}: max_size {} is below min_size {}",
            id, max_size, min_size
        )));
    }

    Ok(ProvisioningSpec {
        wave: WAVE_USER_VOLUMES,
        disk_selector: DiskSelector {
            match_expr: selector(provisioning)?,
            ..Default::default()
        },
        partition_spec: PartitionSpec {
            min_size,
            max_size,
            relative_max_size,
            grow: provisioning.grow.unwrap_or(false),
            label: id.to_string(),
            type_uuid: type_uuid.to_string(),
        },
        filesystem_spec: FilesystemSpec {
            filesystem_type,
            ..Default::default()
        },
    })
}

pub fn user_volumes(env: &TransformEnv<'_>) -> Result<Vec<VolumeResource>> {
    let Some(machine) = env.machine else {
        return Ok(Vec::new());
    };

    let mut out = Vec::with_capacity(machine.user_volumes.len());

    for volume in &machine.user_volumes {
        let id = format!("{}{}", USER_VOLUME_PREFIX, volume.name);
        let filesystem_type = volume.filesystem.resolved_type()?;
        let mut mount = user_mount(&volume.name);

        let spec = match volume.volume_type {
            UserVolumeType::Directory => {
                mount.bind_target = true;
                VolumeConfigSpec {
                    volume_type: VolumeType::Directory,
                    mount,
                    ..Default::default()
                }
            }
            UserVolumeType::Disk => {
                let selector = selector(&volume.provisioning)?;
                mount.project_quota_support = volume.filesystem.project_quota_support;
                VolumeConfigSpec {
                    volume_type: VolumeType::Disk,
                    provisioning: ProvisioningSpec {
                        wave: WAVE_USER_VOLUMES,
                        disk_selector: DiskSelector {
                            match_expr: selector.clone(),
                            ..Default::default()
                        },
                        partition_spec: PartitionSpec {
                            type_uuid: LINUX_FILESYSTEM.to_string(),
                            ..Default::default()
                        },
                        filesystem_spec: FilesystemSpec {
                            filesystem_type,
                            ..Default::default()
                        },
                    },
                    locator: LocatorSpec::DiskMatch(selector),
                    mount,
                    encryption: encryption(volume.encryption.as_ref())?,
                    ..Default::default()
                }
            }
            UserVolumeType::Partition => {
                mount.project_quota_support = volume.filesystem.project_quota_support;
                VolumeConfigSpec {
                    volume_type: VolumeType::Partition,
                    provisioning: partition_provisioning(
                        &id,
                        &volume.provisioning,
                        LINUX_FILESYSTEM,
                        filesystem_type,
                    )?,
                    locator: LocatorSpec::Match(label_match(&id)),
                    mount,
                    encryption: encryption(volume.encryption.as_ref())?,
                    ..Default::default()
                }
            }
        };

        out.push(VolumeResource {
            id,
            label: LABEL_USER_VOLUME,
            spec,
            mount: MountIntent::READ_WRITE,
        });
    }

    Ok(out)
}

/// Raw volumes are provisioned and encrypted but never formatted or mounted.
pub fn raw_volumes(env: &TransformEnv<'_>) -> Result<Vec<VolumeResource>> {
    let Some(machine) = env.machine else {
        return Ok(Vec::new());
    };

    machine
        .raw_volumes
        .iter()
        .map(|volume| {
            let id = format!("{}{}", RAW_VOLUME_PREFIX, volume.name);
            let spec = VolumeConfigSpec {
                volume_type: VolumeType::Partition,
                provisioning: partition_provisioning(
                    &id,
                    &volume.provisioning,
                    LINUX_FILESYSTEM,
                    FilesystemType::None,
                )?,
                locator: LocatorSpec::Match(label_match(&id)),
                encryption: encryption(volume.encryption.as_ref())?,
                ..Default::default()
            };

            Ok(VolumeResource {
                id,
                label: LABEL_RAW_VOLUME,
                spec,
                mount: MountIntent::Skip,
            })
        })
        .collect()
}

/// Existing volumes are located only; nothing is ever created for them.
pub fn existing_volumes(env: &TransformEnv<'_>) -> Result<Vec<VolumeResource>> {
    let Some(machine) = env.machine else {
        return Ok(Vec::new());
    };

    machine
        .existing_volumes
        .iter()
        .map(|volume| {
            let id = format!("{}{}", EXISTING_VOLUME_PREFIX, volume.name);
            let spec = VolumeConfigSpec {
                volume_type: VolumeType::Partition,
                locator: LocatorSpec::Match(expression(
                    &volume.volume_selector,
                    EnvKind::VolumeLocator,
                )?),
                mount: user_mount(&volume.name),
                ..Default::default()
            };

            Ok(VolumeResource {
                id,
                label: LABEL_EXISTING_VOLUME,
                spec,
                mount: MountIntent::Mount {
                    read_only: volume.read_only,
                },
            })
        })
        .collect()
}

pub fn swap_volumes(env: &TransformEnv<'_>) -> Result<Vec<VolumeResource>> {
    let Some(machine) = env.machine else {
        return Ok(Vec::new());
    };

    machine
        .swap_volumes
        .iter()
        .map(|volume| {
            let id = format!("{}{}", SWAP_VOLUME_PREFIX, volume.name);
            let spec = VolumeConfigSpec {
                volume_type: VolumeType::Partition,
                provisioning: partition_provisioning(
                    &id,
                    &volume.provisioning,
                    LINUX_SWAP,
                    FilesystemType::Swap,
                )?,
                locator: LocatorSpec::Match(label_match(&id)),
                encryption: encryption(volume.encryption.as_ref())?,
                ..Default::default()
            };

            Ok(VolumeResource {
                id,
                label: LABEL_SWAP_VOLUME,
                spec,
                mount: MountIntent::READ_WRITE,
            })
        })
        .collect()
}
