// SPDX-License-Identifier: GPL-3.0-only

//! Passphrase resolution for encryption key slots.

use sha2::{Digest, Sha256};
use storage_contracts::{KeyProvider, Passphrase, VolumeError, VolumeResult};
use storage_types::{EncryptionKey, EncryptionKeyKind};

/// Resolves static and node-id keys locally.
///
/// KMS and TPM keys need an external backend; without one they stay
/// unavailable and the volume is retried later.
#[derive(Debug, Clone, Default)]
pub struct LocalKeys {
    node_uuid: String,
}

impl LocalKeys {
    pub fn new(node_uuid: impl Into<String>) -> Self {
        Self {
            node_uuid: node_uuid.into(),
        }
    }

    /// Hex SHA-256 of the node UUID followed by the volume id.
    pub fn node_id_passphrase(&self, volume_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.node_uuid.as_bytes());
        hasher.update(volume_id.as_bytes());

        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

impl KeyProvider for LocalKeys {
    fn passphrase(&self, key: &EncryptionKey, volume_id: &str) -> VolumeResult<Passphrase> {
        match &key.kind {
            EncryptionKeyKind::Static { passphrase } => {
                if passphrase.is_empty() {
                    return Err(VolumeError::config(format!(
                        "static key in slot {} has an empty passphrase",
                        key.slot
                    )));
                }
                Ok(Passphrase::new(passphrase.clone()))
            }
            EncryptionKeyKind::NodeId => {
                if self.node_uuid.is_empty() {
                    return Err(VolumeError::retryable("node UUID is not known yet"));
                }
                Ok(Passphrase::new(self.node_id_passphrase(volume_id)))
            }
            EncryptionKeyKind::Kms { .. } | EncryptionKeyKind::Tpm { .. } => {
                Err(VolumeError::retryable(format!(
                    "key provider not available: {}",
                    key.kind.type_name()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(kind: EncryptionKeyKind) -> EncryptionKey {
        EncryptionKey { slot: 0, kind }
    }

    #[test]
    fn node_id_key_depends_on_node_and_volume() {
        let keys = LocalKeys::new("7b2a5c1e-0000-4000-8000-000000000001");

        let state = keys.passphrase(&key(EncryptionKeyKind::NodeId), "STATE").unwrap();
        let ephemeral = keys.passphrase(&key(EncryptionKeyKind::NodeId), "EPHEMERAL").unwrap();

        assert_eq!(state.as_bytes().len(), 64);
        assert_ne!(state, ephemeral);
        assert_eq!(
            state,
            LocalKeys::new("7b2a5c1e-0000-4000-8000-000000000001")
                .passphrase(&key(EncryptionKeyKind::NodeId), "STATE")
                .unwrap()
        );
    }

    #[test]
    fn static_key_is_passed_through() {
        let keys = LocalKeys::default();
        let pass = keys
            .passphrase(
                &key(EncryptionKeyKind::Static {
                    passphrase: b"secret".to_vec(),
                }),
                "STATE",
            )
            .unwrap();
        assert_eq!(pass.as_bytes(), b"secret");
    }

    #[test]
    fn external_providers_are_retryable() {
        let keys = LocalKeys::new("node");
        let err = keys
            .passphrase(&key(EncryptionKeyKind::Tpm { check_secureboot_on_enroll: true }), "STATE")
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.message.contains("key provider not available"));

        let err = LocalKeys::default()
            .passphrase(&key(EncryptionKeyKind::NodeId), "STATE")
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
