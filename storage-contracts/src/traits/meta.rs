// SPDX-License-Identifier: GPL-3.0-only

use crate::VolumeResult;

/// Small tagged key/value store on the META partition.
pub trait MetaStore: Send + Sync {
    fn read_tag(&self, dev_path: &str, tag: u8) -> VolumeResult<Option<Vec<u8>>>;

    /// Store `value` under `tag`; returns whether anything changed on disk.
    fn set_tag(&self, dev_path: &str, tag: u8, value: &[u8]) -> VolumeResult<bool>;
}
