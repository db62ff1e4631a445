// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;

use storage_types::EncryptionKey;

use crate::VolumeResult;

/// Key material; never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Passphrase(Vec<u8>);

impl Passphrase {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Passphrase(<{} bytes>)", self.0.len())
    }
}

impl Drop for Passphrase {
    fn drop(&mut self) {
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

pub trait KeyProvider: Send + Sync {
    /// Resolve the passphrase of `key` for `volume_id`.
    ///
    /// Unavailable backends (TPM not primed, KMS unreachable) return a
    /// retryable error.
    fn passphrase(&self, key: &EncryptionKey, volume_id: &str) -> VolumeResult<Passphrase>;
}
