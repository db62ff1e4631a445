// SPDX-License-Identifier: GPL-3.0-only

use storage_types::EncryptionSpec;

use crate::VolumeResult;
use crate::traits::key::Passphrase;

pub trait EncryptionProvider: Send + Sync {
    /// Write a fresh header with `key` in `slot`.
    fn format(
        &self,
        dev_path: &str,
        spec: &EncryptionSpec,
        slot: u32,
        key: &Passphrase,
    ) -> VolumeResult<()>;

    /// Map `dev_path` as `mapped_name`; returns the mapped device path.
    fn open(
        &self,
        dev_path: &str,
        mapped_name: &str,
        spec: &EncryptionSpec,
        key: &Passphrase,
    ) -> VolumeResult<String>;

    fn close(&self, mapped_name: &str) -> VolumeResult<()>;

    fn add_key(
        &self,
        dev_path: &str,
        existing: &Passphrase,
        slot: u32,
        key: &Passphrase,
    ) -> VolumeResult<()>;

    fn remove_key(&self, dev_path: &str, slot: u32, existing: &Passphrase) -> VolumeResult<()>;

    /// Whether `key` unlocks `slot`.
    fn check_key(&self, dev_path: &str, slot: u32, key: &Passphrase) -> VolumeResult<bool>;

    /// Occupied key slots.
    fn read_keyslots(&self, dev_path: &str) -> VolumeResult<Vec<u32>>;
}
