// SPDX-License-Identifier: GPL-3.0-only

//! Declarative machine configuration consumed by the volume transformers.
//!
//! Parsed from the `[machine]` table of the service configuration:
//!
//! ```toml
//! [machine]
//! disk_quota_support = true
//!
//! [machine.volumes.EPHEMERAL.provisioning]
//! min_size = "4GiB"
//! max_size = "80%"
//!
//! [[machine.user_volumes]]
//! name = "data"
//! provisioning = { disk_selector = "disk.transport == 'nvme'", min_size = "1GiB" }
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Deserializer};
use storage_types::{
    EncryptionKey, EncryptionKeyKind, EncryptionProviderType, EncryptionSpec, FilesystemType,
    parse_size,
};
use thiserror::Error;

/// Longest user volume name; the id (`u-<name>`) doubles as the partition label.
pub const MAX_VOLUME_NAME_LENGTH: usize = 34;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse machine configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid machine configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// A byte size written as an integer or a string with a unit suffix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Size(pub u64);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSize {
    Bytes(u64),
    Text(String),
}

impl<'de> Deserialize<'de> for Size {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match RawSize::deserialize(deserializer)? {
            RawSize::Bytes(bytes) => Ok(Size(bytes)),
            RawSize::Text(text) => parse_size(&text).map(Size).map_err(serde::de::Error::custom),
        }
    }
}

/// Upper size bound: absolute, or a percentage of the disk (`"80%"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxSize {
    Absolute(u64),
    Relative(u64),
}

impl<'de> Deserialize<'de> for MaxSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match RawSize::deserialize(deserializer)? {
            RawSize::Bytes(bytes) => Ok(MaxSize::Absolute(bytes)),
            RawSize::Text(text) => match text.trim().strip_suffix('%') {
                Some(percent) => {
                    let percent: u64 = percent.trim().parse().map_err(serde::de::Error::custom)?;
                    if percent == 0 || percent > 100 {
                        return Err(serde::de::Error::custom(format!(
                            "relative size {}% is out of range",
                            percent
                        )));
                    }
                    Ok(MaxSize::Relative(percent))
                }
                None => parse_size(&text)
                    .map(MaxSize::Absolute)
                    .map_err(serde::de::Error::custom),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvisioningConfig {
    /// Expression over `disk` and `system_disk`.
    pub disk_selector: Option<String>,
    pub min_size: Option<Size>,
    pub max_size: Option<MaxSize>,
    pub grow: Option<bool>,
}

impl ProvisioningConfig {
    /// `(max_size, relative_max_size)` as stored on a partition spec.
    pub fn max_size_fields(&self) -> (u64, u64) {
        match self.max_size {
            Some(MaxSize::Absolute(bytes)) => (bytes, 0),
            Some(MaxSize::Relative(percent)) => (0, percent),
            None => (0, 0),
        }
    }
}

/// Where the passphrase of one key slot comes from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeySourceConfig {
    Static { passphrase: String },
    NodeId,
    Kms { endpoint: String },
    Tpm {
        #[serde(default)]
        check_secureboot_status_on_enroll: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EncryptionKeyConfig {
    pub slot: u32,
    #[serde(flatten)]
    pub source: KeySourceConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EncryptionConfig {
    pub provider: String,
    pub keys: Vec<EncryptionKeyConfig>,
    pub cipher: String,
    pub key_size: u32,
    pub block_size: u64,
    pub perf_options: Vec<String>,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            provider: EncryptionProviderType::Luks2.as_str().to_string(),
            keys: Vec::new(),
            cipher: String::new(),
            key_size: 0,
            block_size: 0,
            perf_options: Vec::new(),
        }
    }
}

impl EncryptionConfig {
    pub fn to_spec(&self) -> Result<EncryptionSpec> {
        let provider: EncryptionProviderType = self
            .provider
            .parse()
            .map_err(|err: anyhow::Error| ConfigError::Invalid(err.to_string()))?;

        let mut keys = Vec::with_capacity(self.keys.len());
        let mut slots = BTreeSet::new();

        for key in &self.keys {
            if !slots.insert(key.slot) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate encryption key slot {}",
                    key.slot
                )));
            }

            let kind = match &key.source {
                KeySourceConfig::Static { passphrase } => EncryptionKeyKind::Static {
                    passphrase: passphrase.as_bytes().to_vec(),
                },
                KeySourceConfig::NodeId => EncryptionKeyKind::NodeId,
                KeySourceConfig::Kms { endpoint } => EncryptionKeyKind::Kms {
                    endpoint: endpoint.clone(),
                },
                KeySourceConfig::Tpm {
                    check_secureboot_status_on_enroll,
                } => EncryptionKeyKind::Tpm {
                    check_secureboot_on_enroll: *check_secureboot_status_on_enroll,
                },
            };

            keys.push(EncryptionKey {
                slot: key.slot,
                kind,
            });
        }

        if provider != EncryptionProviderType::None && keys.is_empty() {
            return Err(ConfigError::Invalid("encryption requires at least one key".into()));
        }

        keys.sort_by_key(|key| key.slot);

        Ok(EncryptionSpec {
            provider,
            keys,
            cipher: self.cipher.clone(),
            key_size: self.key_size,
            block_size: self.block_size,
            perf_options: self.perf_options.clone(),
        })
    }
}

/// Overrides of a built-in system volume (`STATE`, `EPHEMERAL`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SystemVolumeConfig {
    pub provisioning: ProvisioningConfig,
    pub encryption: Option<EncryptionConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserVolumeType {
    #[default]
    Partition,
    Disk,
    Directory,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilesystemConfig {
    #[serde(rename = "type")]
    pub filesystem_type: Option<String>,
    pub project_quota_support: bool,
}

impl FilesystemConfig {
    /// Declared type, XFS when unset.
    pub fn resolved_type(&self) -> Result<FilesystemType> {
        match &self.filesystem_type {
            None => Ok(FilesystemType::Xfs),
            Some(name) => name.parse().map_err(ConfigError::Invalid),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UserVolumeConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub volume_type: UserVolumeType,
    pub provisioning: ProvisioningConfig,
    pub filesystem: FilesystemConfig,
    pub encryption: Option<EncryptionConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawVolumeConfig {
    pub name: String,
    pub provisioning: ProvisioningConfig,
    pub encryption: Option<EncryptionConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExistingVolumeConfig {
    pub name: String,
    /// Expression over `volume`, `disk` and `system_disk`.
    pub volume_selector: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SwapVolumeConfig {
    pub name: String,
    pub provisioning: ProvisioningConfig,
    pub encryption: Option<EncryptionConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ZswapConfig {
    pub max_pool_percent: u32,
    pub shrinker_enabled: bool,
}

impl Default for ZswapConfig {
    fn default() -> Self {
        Self {
            max_pool_percent: 20,
            shrinker_enabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FsScrubConfig {
    pub mountpoint: String,
    #[serde(default = "default_scrub_period")]
    pub period_secs: u64,
}

fn default_scrub_period() -> u64 {
    7 * 24 * 60 * 60
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MachineConfig {
    pub disk_quota_support: bool,
    /// Per-label encryption of the system disk volumes, in the older layout.
    pub system_disk_encryption: BTreeMap<String, EncryptionConfig>,
    pub volumes: BTreeMap<String, SystemVolumeConfig>,
    pub user_volumes: Vec<UserVolumeConfig>,
    pub raw_volumes: Vec<RawVolumeConfig>,
    pub existing_volumes: Vec<ExistingVolumeConfig>,
    pub swap_volumes: Vec<SwapVolumeConfig>,
    pub zswap: Option<ZswapConfig>,
    pub fs_scrub: Vec<FsScrubConfig>,
}

fn validate_name(kind: &str, name: &str, seen: &mut BTreeSet<String>) -> Result<()> {
    if name.is_empty() {
        return Err(ConfigError::Invalid(format!("{} volume name is empty", kind)));
    }
    if name.len() > MAX_VOLUME_NAME_LENGTH {
        return Err(ConfigError::Invalid(format!(
            "{} volume name {:?} is longer than {} characters",
            kind, name, MAX_VOLUME_NAME_LENGTH
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(ConfigError::Invalid(format!(
            "{} volume name {:?} may only contain lowercase letters, digits and dashes",
            kind, name
        )));
    }
    if !seen.insert(name.to_string()) {
        return Err(ConfigError::Invalid(format!("duplicate volume name {:?}", name)));
    }
    Ok(())
}

impl MachineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: MachineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for name in self.volumes.keys().chain(self.system_disk_encryption.keys()) {
            if name != storage_types::constants::STATE_PARTITION_LABEL
                && name != storage_types::constants::EPHEMERAL_PARTITION_LABEL
            {
                return Err(ConfigError::Invalid(format!(
                    "unknown system volume {:?}",
                    name
                )));
            }
        }

        let mut seen = BTreeSet::new();
        for volume in &self.user_volumes {
            validate_name("user", &volume.name, &mut seen)?;
            volume.filesystem.resolved_type()?;
            if volume.volume_type == UserVolumeType::Directory && volume.encryption.is_some() {
                return Err(ConfigError::Invalid(format!(
                    "directory volume {:?} cannot be encrypted",
                    volume.name
                )));
            }
        }
        for volume in &self.raw_volumes {
            validate_name("raw", &volume.name, &mut seen)?;
        }
        for volume in &self.existing_volumes {
            validate_name("existing", &volume.name, &mut seen)?;
        }
        for volume in &self.swap_volumes {
            validate_name("swap", &volume.name, &mut seen)?;
        }

        let encryptions = self
            .volumes
            .values()
            .filter_map(|v| v.encryption.as_ref())
            .chain(self.system_disk_encryption.values())
            .chain(self.user_volumes.iter().filter_map(|v| v.encryption.as_ref()))
            .chain(self.raw_volumes.iter().filter_map(|v| v.encryption.as_ref()))
            .chain(self.swap_volumes.iter().filter_map(|v| v.encryption.as_ref()));
        for encryption in encryptions {
            encryption.to_spec()?;
        }

        if let Some(zswap) = &self.zswap
            && (zswap.max_pool_percent == 0 || zswap.max_pool_percent > 100)
        {
            return Err(ConfigError::Invalid(format!(
                "zswap max_pool_percent {} is out of range",
                zswap.max_pool_percent
            )));
        }

        Ok(())
    }

    /// Overrides of system volume `name`.
    pub fn system_volume(&self, name: &str) -> Option<&SystemVolumeConfig> {
        self.volumes.get(name)
    }

    /// Encryption of system volume `name`: the volume override wins over the
    /// per-label system disk encryption.
    pub fn system_volume_encryption(&self, name: &str) -> Result<Option<EncryptionSpec>> {
        let config = self
            .volumes
            .get(name)
            .and_then(|v| v.encryption.as_ref())
            .or_else(|| self.system_disk_encryption.get(name));

        config.map(EncryptionConfig::to_spec).transpose()
    }
}
