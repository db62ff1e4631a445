// SPDX-License-Identifier: GPL-3.0-only

//! Built-in volumes: META, STATE, EPHEMERAL and the directory tree under `/var`.

use storage_expr::{EnvKind, Expression};
use storage_types::constants::{
    EPHEMERAL_MIN_SIZE, EPHEMERAL_MOUNT_POINT, EPHEMERAL_PARTITION_LABEL, LABEL_SYSTEM_VOLUME,
    META_FILESYSTEM_NAME, META_PARTITION_LABEL, META_SIZE, STATE_MOUNT_POINT,
    STATE_PARTITION_LABEL, STATE_SIZE, USER_VOLUME_MOUNT_POINT, WAVE_SYSTEM_DISK,
};
use storage_types::partition_types::LINUX_FILESYSTEM;
use storage_types::{
    DiskSelector, EncryptionSpec, FilesystemSpec, FilesystemType, LocatorSpec, MountSpec,
    PartitionSpec, PersistedEncryption, ProvisioningSpec, SymlinkProvisioningSpec,
    VolumeConfigSpec, VolumeType,
};
use tracing::warn;

use super::{MountIntent, TransformEnv, VolumeResource, expression, label_match};
use crate::config::{ConfigError, Result};

pub const STATE_SELINUX_LABEL: &str = "system_u:object_r:system_state_t:s0";
pub const EPHEMERAL_SELINUX_LABEL: &str = "system_u:object_r:ephemeral_t:s0";

/// Id of the `/var/run` symlink volume.
pub const VAR_RUN: &str = "/var/run";

const ETCD_ID: u32 = 60;
const APISERVER_ID: u32 = 65534;

fn system_volume(id: &str, spec: VolumeConfigSpec) -> VolumeResource {
    VolumeResource {
        id: id.to_string(),
        label: LABEL_SYSTEM_VOLUME,
        spec,
        mount: MountIntent::READ_WRITE,
    }
}

/// Locator of the META partition; also used to find the system disk.
pub fn meta_locator() -> Expression {
    Expression::new(
        format!(
            "volume.partition_label == \"{}\" && (volume.name == \"\" || volume.name == \"{}\") && volume.size == {}u",
            META_PARTITION_LABEL, META_FILESYSTEM_NAME, META_SIZE
        ),
        EnvKind::VolumeLocator,
    )
}

fn system_disk_selector() -> Expression {
    Expression::new("system_disk", EnvKind::DiskLocator)
}

pub fn meta_volume(_env: &TransformEnv<'_>) -> Result<Vec<VolumeResource>> {
    let spec = VolumeConfigSpec {
        volume_type: VolumeType::Partition,
        locator: LocatorSpec::Match(meta_locator()),
        ..Default::default()
    };

    let mut volume = system_volume(META_PARTITION_LABEL, spec);
    volume.mount = MountIntent::Skip;
    Ok(vec![volume])
}

fn directory_mount(target: &str, mode: u32, selinux_label: &str) -> MountSpec {
    MountSpec {
        target_path: target.to_string(),
        selinux_label: selinux_label.to_string(),
        file_mode: mode,
        ..Default::default()
    }
}

/// STATE encryption as persisted on META, or none.
fn persisted_state_encryption(env: &TransformEnv<'_>) -> EncryptionSpec {
    let Some(bytes) = env.state_encryption_meta.filter(|b| !b.is_empty()) else {
        return EncryptionSpec::default();
    };

    match PersistedEncryption::parse(bytes).and_then(|persisted| persisted.to_spec()) {
        Ok(spec) => spec,
        Err(err) => {
            warn!("ignoring STATE encryption stored in META: {:#}", err);
            EncryptionSpec::default()
        }
    }
}

pub fn state_volume(env: &TransformEnv<'_>) -> Result<Vec<VolumeResource>> {
    if env.in_container {
        let spec = VolumeConfigSpec {
            volume_type: VolumeType::Directory,
            mount: directory_mount(STATE_MOUNT_POINT, 0o700, STATE_SELINUX_LABEL),
            ..Default::default()
        };
        return Ok(vec![system_volume(STATE_PARTITION_LABEL, spec)]);
    }

    let mount = MountSpec {
        target_path: STATE_MOUNT_POINT.to_string(),
        selinux_label: STATE_SELINUX_LABEL.to_string(),
        file_mode: 0o700,
        ..Default::default()
    };

    let spec = match env.machine {
        Some(machine) => VolumeConfigSpec {
            volume_type: VolumeType::Partition,
            provisioning: ProvisioningSpec {
                wave: WAVE_SYSTEM_DISK,
                disk_selector: DiskSelector {
                    match_expr: system_disk_selector(),
                    ..Default::default()
                },
                partition_spec: PartitionSpec {
                    min_size: STATE_SIZE,
                    max_size: STATE_SIZE,
                    label: STATE_PARTITION_LABEL.to_string(),
                    type_uuid: LINUX_FILESYSTEM.to_string(),
                    ..Default::default()
                },
                filesystem_spec: FilesystemSpec {
                    filesystem_type: FilesystemType::Xfs,
                    label: STATE_PARTITION_LABEL.to_string(),
                },
            },
            locator: LocatorSpec::Match(label_match(STATE_PARTITION_LABEL)),
            mount,
            encryption: machine
                .system_volume_encryption(STATE_PARTITION_LABEL)?
                .unwrap_or_default(),
            ..Default::default()
        },
        // its encryption is only known once META has been read
        None if !env.meta_ready => return Ok(Vec::new()),
        // no configuration yet: only look for an existing STATE
        None => VolumeConfigSpec {
            volume_type: VolumeType::Partition,
            locator: LocatorSpec::Match(Expression::new(
                format!(
                    "volume.partition_label == \"{}\" && volume.name != \"\"",
                    STATE_PARTITION_LABEL
                ),
                EnvKind::VolumeLocator,
            )),
            mount,
            encryption: persisted_state_encryption(env),
            ..Default::default()
        },
    };

    Ok(vec![system_volume(STATE_PARTITION_LABEL, spec)])
}

pub fn ephemeral_volume(env: &TransformEnv<'_>) -> Result<Vec<VolumeResource>> {
    let Some(machine) = env.machine else {
        return Ok(Vec::new());
    };

    if env.in_container {
        let spec = VolumeConfigSpec {
            volume_type: VolumeType::Directory,
            mount: directory_mount(EPHEMERAL_MOUNT_POINT, 0o755, EPHEMERAL_SELINUX_LABEL),
            ..Default::default()
        };
        return Ok(vec![system_volume(EPHEMERAL_PARTITION_LABEL, spec)]);
    }

    let overrides = machine
        .system_volume(EPHEMERAL_PARTITION_LABEL)
        .map(|v| v.provisioning.clone())
        .unwrap_or_default();

    let selector = match &overrides.disk_selector {
        Some(source) => expression(source, EnvKind::DiskLocator)?,
        None => system_disk_selector(),
    };
    let (max_size, relative_max_size) = overrides.max_size_fields();
    let min_size = overrides
        .min_size
        .map(|size| size.0)
        .unwrap_or(EPHEMERAL_MIN_SIZE);

    if max_size != 0 && max_size < min_size {
        return Err(ConfigError::Invalid(format!(
            "EPHEMERAL max_size {} is below min_size {}",
            max_size, min_size
        )));
    }

    let spec = VolumeConfigSpec {
        volume_type: VolumeType::Partition,
        provisioning: ProvisioningSpec {
            wave: WAVE_SYSTEM_DISK,
            disk_selector: DiskSelector {
                match_expr: selector,
                ..Default::default()
            },
            partition_spec: PartitionSpec {
                min_size,
                max_size,
                relative_max_size,
                grow: overrides.grow.unwrap_or(true),
                label: EPHEMERAL_PARTITION_LABEL.to_string(),
                type_uuid: LINUX_FILESYSTEM.to_string(),
            },
            filesystem_spec: FilesystemSpec {
                filesystem_type: FilesystemType::Xfs,
                label: EPHEMERAL_PARTITION_LABEL.to_string(),
            },
        },
        locator: LocatorSpec::Match(label_match(EPHEMERAL_PARTITION_LABEL)),
        mount: MountSpec {
            target_path: EPHEMERAL_MOUNT_POINT.to_string(),
            selinux_label: EPHEMERAL_SELINUX_LABEL.to_string(),
            project_quota_support: machine.disk_quota_support,
            file_mode: 0o755,
            ..Default::default()
        },
        encryption: machine
            .system_volume_encryption(EPHEMERAL_PARTITION_LABEL)?
            .unwrap_or_default(),
        ..Default::default()
    };

    Ok(vec![system_volume(EPHEMERAL_PARTITION_LABEL, spec)])
}

struct StandardDirectory {
    path: &'static str,
    mode: u32,
    uid: u32,
    gid: u32,
    recursive: bool,
    selinux_label: &'static str,
}

const fn dir(path: &'static str, mode: u32, selinux_label: &'static str) -> StandardDirectory {
    StandardDirectory {
        path,
        mode,
        uid: 0,
        gid: 0,
        recursive: false,
        selinux_label,
    }
}

const fn tree(path: &'static str, mode: u32, id: u32, selinux_label: &'static str) -> StandardDirectory {
    StandardDirectory {
        path,
        mode,
        uid: id,
        gid: id,
        recursive: true,
        selinux_label,
    }
}

// parents come before their children
const STANDARD_DIRECTORIES: &[StandardDirectory] = &[
    dir("/var/log", 0o755, "system_u:object_r:var_log_t:s0"),
    dir("/var/log/audit", 0o700, "system_u:object_r:audit_log_t:s0"),
    tree("/var/log/audit/kube", 0o700, APISERVER_ID, "system_u:object_r:kube_log_t:s0"),
    dir("/var/log/containers", 0o755, "system_u:object_r:containers_log_t:s0"),
    dir("/var/log/pods", 0o755, "system_u:object_r:pods_log_t:s0"),
    dir("/var/lib", 0o700, EPHEMERAL_SELINUX_LABEL),
    tree("/var/lib/etcd", 0o700, ETCD_ID, "system_u:object_r:etcd_data_t:s0"),
    dir("/var/lib/containerd", 0o000, "system_u:object_r:containerd_state_t:s0"),
    dir("/var/lib/kubelet", 0o700, "system_u:object_r:kubelet_state_t:s0"),
    tree("/var/lib/cni", 0o700, 0, "system_u:object_r:cni_state_t:s0"),
    dir("/var/lib/kubelet/seccomp", 0o700, "system_u:object_r:seccomp_profile_t:s0"),
    tree("/var/lib/kubelet/seccomp/profiles", 0o700, 0, "system_u:object_r:seccomp_profile_t:s0"),
    dir(USER_VOLUME_MOUNT_POINT, 0o755, EPHEMERAL_SELINUX_LABEL),
    dir("/var/run/lock", 0o755, "system_u:object_r:var_lock_t:s0"),
];

/// Split `/var/log/pods` into the parent volume id and the last component.
fn split_parent(path: &str) -> Option<(&str, &str)> {
    let (parent, name) = path.rsplit_once('/')?;
    let parent_id = match parent {
        EPHEMERAL_MOUNT_POINT => EPHEMERAL_PARTITION_LABEL,
        other => other,
    };
    Some((parent_id, name))
}

/// The `/var/run` symlink and the standard directories under `/var`.
pub fn standard_directories(_env: &TransformEnv<'_>) -> Result<Vec<VolumeResource>> {
    let mut known = vec![EPHEMERAL_PARTITION_LABEL, VAR_RUN];
    let mut out = Vec::with_capacity(STANDARD_DIRECTORIES.len() + 1);

    out.push(system_volume(
        VAR_RUN,
        VolumeConfigSpec {
            volume_type: VolumeType::Symlink,
            mount: MountSpec {
                target_path: "run".to_string(),
                parent_id: EPHEMERAL_PARTITION_LABEL.to_string(),
                ..Default::default()
            },
            symlink: SymlinkProvisioningSpec {
                symlink_target_path: "/run".to_string(),
                force: true,
            },
            ..Default::default()
        },
    ));

    for entry in STANDARD_DIRECTORIES {
        let Some((parent_id, name)) = split_parent(entry.path) else {
            return Err(ConfigError::Invalid(format!("bad directory path {:?}", entry.path)));
        };
        if !known.contains(&parent_id) {
            return Err(ConfigError::Invalid(format!(
                "parent {:?} of {:?} is not a known volume",
                parent_id, entry.path
            )));
        }

        out.push(system_volume(
            entry.path,
            VolumeConfigSpec {
                volume_type: VolumeType::Directory,
                mount: MountSpec {
                    target_path: name.to_string(),
                    parent_id: parent_id.to_string(),
                    selinux_label: entry.selinux_label.to_string(),
                    file_mode: entry.mode,
                    uid: entry.uid,
                    gid: entry.gid,
                    recursive_relabel: entry.recursive,
                    ..Default::default()
                },
                ..Default::default()
            },
        ));
        known.push(entry.path);
    }

    Ok(out)
}

/// Read-only image paths made writable with an overlay on EPHEMERAL.
pub const OVERLAY_PATHS: &[&str] = &[
    "/etc/cni",
    "/etc/kubernetes",
    "/usr/libexec/kubernetes",
    "/usr/local/lib/kubelet/credentialproviders",
    "/opt",
];

pub fn overlay_volumes(env: &TransformEnv<'_>) -> Result<Vec<VolumeResource>> {
    if env.machine.is_none() || env.in_container {
        return Ok(Vec::new());
    }

    Ok(OVERLAY_PATHS
        .iter()
        .map(|path| {
            system_volume(
                path,
                VolumeConfigSpec {
                    parent_id: EPHEMERAL_PARTITION_LABEL.to_string(),
                    volume_type: VolumeType::Overlay,
                    mount: MountSpec {
                        target_path: path.to_string(),
                        parent_id: EPHEMERAL_PARTITION_LABEL.to_string(),
                        selinux_label: EPHEMERAL_SELINUX_LABEL.to_string(),
                        file_mode: 0o755,
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )
        })
        .collect())
}
