// SPDX-License-Identifier: GPL-3.0-only

//! Machine configuration to `VolumeConfig` documents.
//!
//! Each transformer turns one part of the configuration into a list of
//! [`VolumeResource`]s. System transformers always run; user transformers run
//! once the system volumes are in place.

mod system;
mod user;

use std::collections::BTreeSet;

use storage_expr::{EnvKind, Expression};
use storage_types::VolumeConfigSpec;

use crate::config::{ConfigError, MachineConfig, Result};

pub use system::{
    EPHEMERAL_SELINUX_LABEL, STATE_SELINUX_LABEL, VAR_RUN, ephemeral_volume, meta_locator,
    meta_volume, overlay_volumes, standard_directories, state_volume,
};
pub use user::{existing_volumes, raw_volumes, swap_volumes, user_volumes};

/// Inputs shared by every transformer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransformEnv<'a> {
    /// `None` when the node has no machine configuration yet.
    pub machine: Option<&'a MachineConfig>,
    /// STATE and EPHEMERAL become plain directories.
    pub in_container: bool,
    /// META is ready, so `state_encryption_meta` is what it holds.
    pub meta_ready: bool,
    /// STATE encryption persisted on the META partition.
    pub state_encryption_meta: Option<&'a [u8]>,
}

/// Whether and how a volume gets mounted by the configuration controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountIntent {
    Skip,
    Mount { read_only: bool },
}

impl MountIntent {
    pub const READ_WRITE: MountIntent = MountIntent::Mount { read_only: false };
}

/// One volume produced by a transformer.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeResource {
    pub id: String,
    /// Value of the volume kind label (`system-volume`, `user-volume`, ...).
    pub label: &'static str,
    pub spec: VolumeConfigSpec,
    pub mount: MountIntent,
}

pub type Transformer = fn(&TransformEnv<'_>) -> Result<Vec<VolumeResource>>;

pub const SYSTEM_TRANSFORMERS: &[Transformer] = &[
    meta_volume,
    state_volume,
    ephemeral_volume,
    standard_directories,
    overlay_volumes,
];

pub const USER_TRANSFORMERS: &[Transformer] =
    &[user_volumes, raw_volumes, existing_volumes, swap_volumes];

/// Run `transformers` in order; volume ids must be unique across all of them.
pub fn apply(env: &TransformEnv<'_>, transformers: &[Transformer]) -> Result<Vec<VolumeResource>> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();

    for transformer in transformers {
        for resource in transformer(env)? {
            if !seen.insert(resource.id.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "volume {:?} is declared twice",
                    resource.id
                )));
            }
            out.push(resource);
        }
    }

    Ok(out)
}

/// Compile `source` now so a typo fails the configuration, not the volume.
pub(crate) fn expression(source: &str, env: EnvKind) -> Result<Expression> {
    Expression::parse(source, env)
        .map_err(|err| ConfigError::Invalid(format!("invalid expression {:?}: {}", source, err)))
}

/// Locator matching a partition by its GPT label.
pub(crate) fn label_match(label: &str) -> Expression {
    Expression::new(
        format!("volume.partition_label == \"{}\"", label),
        EnvKind::VolumeLocator,
    )
}

/// Disk selector used when none is configured: never matches.
pub(crate) fn no_match() -> Expression {
    Expression::new("false", EnvKind::DiskLocator)
}
