// SPDX-License-Identifier: GPL-3.0-only

//! Volume encryption settings and their persisted JSON forms.
//!
//! The STATE encryption settings are stored on the META partition so that a
//! node can unlock STATE before its machine configuration is available. Two
//! document shapes exist on disk:
//!
//! - the current shape (`type` per key, base64 `staticPassphrase`, `perfOptions`)
//! - the legacy shape (one nested object per key source, plain `passphrase`,
//!   `options`), written by older releases and still accepted on read
//!
//! Both shapes re-serialize byte-for-byte.

use std::fmt;

use anyhow::{Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionProviderType {
    #[default]
    None,
    Luks2,
}

impl EncryptionProviderType {
    pub fn as_str(self) -> &'static str {
        match self {
            EncryptionProviderType::None => "none",
            EncryptionProviderType::Luks2 => "luks2",
        }
    }
}

impl fmt::Display for EncryptionProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EncryptionProviderType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "none" => Ok(EncryptionProviderType::None),
            "luks2" => Ok(EncryptionProviderType::Luks2),
            other => Err(anyhow!("unsupported encryption provider {:?}", other)),
        }
    }
}

/// Where the passphrase of one key slot comes from.
#[derive(Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EncryptionKeyKind {
    Static {
        #[serde(skip)]
        passphrase: Vec<u8>,
    },
    NodeId,
    Kms {
        endpoint: String,
    },
    Tpm {
        check_secureboot_on_enroll: bool,
    },
}

impl EncryptionKeyKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            EncryptionKeyKind::Static { .. } => "static",
            EncryptionKeyKind::NodeId => "nodeID",
            EncryptionKeyKind::Kms { .. } => "kms",
            EncryptionKeyKind::Tpm { .. } => "tpm",
        }
    }
}

impl fmt::Debug for EncryptionKeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncryptionKeyKind::Static { .. } => f.write_str("Static { .. }"),
            EncryptionKeyKind::NodeId => f.write_str("NodeId"),
            EncryptionKeyKind::Kms { endpoint } => {
                f.debug_struct("Kms").field("endpoint", endpoint).finish()
            }
            EncryptionKeyKind::Tpm {
                check_secureboot_on_enroll,
            } => f
                .debug_struct("Tpm")
                .field("check_secureboot_on_enroll", check_secureboot_on_enroll)
                .finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncryptionKey {
    pub slot: u32,
    pub kind: EncryptionKeyKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EncryptionSpec {
    pub provider: EncryptionProviderType,
    /// Ordered by slot.
    pub keys: Vec<EncryptionKey>,
    pub cipher: String,
    pub key_size: u32,
    pub block_size: u64,
    pub perf_options: Vec<String>,
}

impl EncryptionSpec {
    pub fn is_enabled(&self) -> bool {
        self.provider != EncryptionProviderType::None
    }
}

fn is_zero_u32(value: &u32) -> bool {
    *value == 0
}

fn is_zero_u64(value: &u64) -> bool {
    *value == 0
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Current persisted shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EncryptionConfigDocument {
    pub provider: EncryptionProviderType,
    pub keys: Vec<EncryptionKeyDocument>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cipher: String,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub key_size: u32,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub block_size: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub perf_options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EncryptionKeyDocument {
    pub slot: u32,
    #[serde(rename = "type")]
    pub key_type: String,
    /// Base64 of the passphrase bytes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub static_passphrase: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kms_endpoint: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub tpm_check_secureboot_status_on_enroll: bool,
}

/// Legacy persisted shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyEncryptionConfig {
    pub provider: String,
    #[serde(default)]
    pub keys: Vec<LegacyEncryptionKey>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cipher: String,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub key_size: u32,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub block_size: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyEncryptionKey {
    #[serde(default, rename = "static", skip_serializing_if = "Option::is_none")]
    pub static_key: Option<LegacyStaticKey>,
    #[serde(default, rename = "nodeID", skip_serializing_if = "Option::is_none")]
    pub node_id: Option<LegacyEmptyKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kms: Option<LegacyKmsKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpm: Option<LegacyTpmKey>,
    pub slot: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyStaticKey {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub passphrase: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyEmptyKey {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyKmsKey {
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyTpmKey {
    #[serde(
        default,
        rename = "checkSecurebootStatusOnEnroll",
        skip_serializing_if = "Option::is_none"
    )]
    pub check_secureboot_status_on_enroll: Option<bool>,
}

/// An encryption configuration as found on the META partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistedEncryption {
    Current(EncryptionConfigDocument),
    Legacy(LegacyEncryptionConfig),
}

impl PersistedEncryption {
    /// Parse stored bytes, falling back to the legacy shape.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        match serde_json::from_slice::<EncryptionConfigDocument>(bytes) {
            Ok(current) => Ok(PersistedEncryption::Current(current)),
            Err(current_err) => serde_json::from_slice::<LegacyEncryptionConfig>(bytes)
                .map(PersistedEncryption::Legacy)
                .map_err(|legacy_err| {
                    anyhow!(
                        "failed to parse encryption config: {} (legacy: {})",
                        current_err,
                        legacy_err
                    )
                }),
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, PersistedEncryption::Legacy(_))
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            PersistedEncryption::Current(doc) => serde_json::to_vec(doc)?,
            PersistedEncryption::Legacy(doc) => serde_json::to_vec(doc)?,
        };
        Ok(bytes)
    }

    /// Canonical (current-shape) form of `spec`.
    pub fn from_spec(spec: &EncryptionSpec) -> Self {
        let keys = spec
            .keys
            .iter()
            .map(|key| {
                let mut doc = EncryptionKeyDocument {
                    slot: key.slot,
                    key_type: key.kind.type_name().to_string(),
                    static_passphrase: String::new(),
                    kms_endpoint: String::new(),
                    tpm_check_secureboot_status_on_enroll: false,
                };

                match &key.kind {
                    EncryptionKeyKind::Static { passphrase } => {
                        doc.static_passphrase = STANDARD.encode(passphrase)
                    }
                    EncryptionKeyKind::Kms { endpoint } => doc.kms_endpoint = endpoint.clone(),
                    EncryptionKeyKind::Tpm {
                        check_secureboot_on_enroll,
                    } => doc.tpm_check_secureboot_status_on_enroll = *check_secureboot_on_enroll,
                    EncryptionKeyKind::NodeId => {}
                }

                doc
            })
            .collect();

        PersistedEncryption::Current(EncryptionConfigDocument {
            provider: spec.provider,
            keys,
            cipher: spec.cipher.clone(),
            key_size: spec.key_size,
            block_size: spec.block_size,
            perf_options: spec.perf_options.clone(),
        })
    }

    pub fn to_spec(&self) -> Result<EncryptionSpec> {
        match self {
            PersistedEncryption::Current(doc) => {
                let keys = doc
                    .keys
                    .iter()
                    .map(|key| {
                        let kind = match key.key_type.as_str() {
                            "static" => EncryptionKeyKind::Static {
                                passphrase: STANDARD.decode(&key.static_passphrase)?,
                            },
                            "nodeID" => EncryptionKeyKind::NodeId,
                            "kms" => EncryptionKeyKind::Kms {
                                endpoint: key.kms_endpoint.clone(),
                            },
                            "tpm" => EncryptionKeyKind::Tpm {
                                check_secureboot_on_enroll: key
                                    .tpm_check_secureboot_status_on_enroll,
                            },
                            other => return Err(anyhow!("unknown key type {:?}", other)),
                        };

                        Ok(EncryptionKey {
                            slot: key.slot,
                            kind,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;

                Ok(EncryptionSpec {
                    provider: doc.provider,
                    keys: sorted_by_slot(keys),
                    cipher: doc.cipher.clone(),
                    key_size: doc.key_size,
                    block_size: doc.block_size,
                    perf_options: doc.perf_options.clone(),
                })
            }
            PersistedEncryption::Legacy(doc) => {
                let keys = doc
                    .keys
                    .iter()
                    .map(|key| {
                        let kind = if let Some(static_key) = &key.static_key {
                            EncryptionKeyKind::Static {
                                passphrase: static_key.passphrase.as_bytes().to_vec(),
                            }
                        } else if key.node_id.is_some() {
                            EncryptionKeyKind::NodeId
                        } else if let Some(kms) = &key.kms {
                            EncryptionKeyKind::Kms {
                                endpoint: kms.endpoint.clone(),
                            }
                        } else if let Some(tpm) = &key.tpm {
                            EncryptionKeyKind::Tpm {
                                check_secureboot_on_enroll: tpm
                                    .check_secureboot_status_on_enroll
                                    .unwrap_or(false),
                            }
                        } else {
                            return Err(anyhow!("key in slot {} has no source", key.slot));
                        };

                        Ok(EncryptionKey {
                            slot: key.slot,
                            kind,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;

                Ok(EncryptionSpec {
                    provider: doc.provider.parse()?,
                    keys: sorted_by_slot(keys),
                    cipher: doc.cipher.clone(),
                    key_size: doc.key_size,
                    block_size: doc.block_size,
                    perf_options: doc.options.clone(),
                })
            }
        }
    }
}

fn sorted_by_slot(mut keys: Vec<EncryptionKey>) -> Vec<EncryptionKey> {
    keys.sort_by_key(|key| key.slot);
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    const CURRENT: &str = r#"{"provider":"luks2","keys":[{"slot":0,"type":"static","staticPassphrase":"c2VjcmV0"},{"slot":1,"type":"nodeID"},{"slot":2,"type":"tpm","tpmCheckSecurebootStatusOnEnroll":true}],"cipher":"aes-xts-plain64","keySize":512,"blockSize":4096,"perfOptions":["no_read_workqueue"]}"#;

    const LEGACY: &str = r#"{"provider":"luks2","keys":[{"static":{"passphrase":"secret"},"slot":0},{"nodeID":{},"slot":1},{"kms":{"endpoint":"https://kms"},"slot":2}],"options":["no_write_workqueue"]}"#;

    #[test]
    fn current_shape_round_trips_bit_equal() {
        let parsed = PersistedEncryption::parse(CURRENT.as_bytes()).unwrap();
        assert!(!parsed.is_legacy());
        assert_eq!(parsed.to_json().unwrap(), CURRENT.as_bytes());
    }

    #[test]
    fn legacy_shape_round_trips_bit_equal() {
        let parsed = PersistedEncryption::parse(LEGACY.as_bytes()).unwrap();
        assert!(parsed.is_legacy());
        assert_eq!(parsed.to_json().unwrap(), LEGACY.as_bytes());
    }

    #[test]
    fn legacy_upgrades_to_the_same_spec_as_current() {
        let legacy = PersistedEncryption::parse(LEGACY.as_bytes())
            .unwrap()
            .to_spec()
            .unwrap();

        assert_eq!(legacy.provider, EncryptionProviderType::Luks2);
        assert_eq!(
            legacy.keys[0].kind,
            EncryptionKeyKind::Static {
                passphrase: b"secret".to_vec()
            }
        );
        assert_eq!(legacy.keys[1].kind, EncryptionKeyKind::NodeId);
        assert_eq!(legacy.perf_options, vec!["no_write_workqueue".to_string()]);

        let upgraded = PersistedEncryption::from_spec(&legacy);
        assert_eq!(upgraded.to_spec().unwrap(), legacy);
    }

    #[test]
    fn spec_round_trips_through_current_shape() {
        let spec = PersistedEncryption::parse(CURRENT.as_bytes())
            .unwrap()
            .to_spec()
            .unwrap();
        let again = PersistedEncryption::from_spec(&spec).to_json().unwrap();
        assert_eq!(again, CURRENT.as_bytes());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(PersistedEncryption::parse(b"{\"keys\": 5}").is_err());
    }
}
