// SPDX-License-Identifier: GPL-3.0-only

//! META partition key/value store.
//!
//! The partition holds two copies of a tagged value list. Each copy:
//!
//! ```text
//! magic1 u32 BE | crc32 u32 BE | sequence u32 BE | (tag u8, len u16 BE, value)* | 0x00 | ... | magic2 u32 BE
//! ```
//!
//! The CRC covers everything between itself and `magic2`. The valid copy with
//! the highest sequence is current.

use std::collections::BTreeMap;

use storage_contracts::{MetaStore, VolumeResult};
use tracing::{debug, info};

use crate::blockdev::BlockDevice;
use crate::{Result, SysError};

pub const COPY_SIZE: usize = 256 * 1024;
const MAGIC1: u32 = 0x5a4b3c2d;
const MAGIC2: u32 = 0xa5b4c3d2;
const HEADER_LEN: usize = 12;
const TRAILER_LEN: usize = 4;
const TAG_END: u8 = 0;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Meta {
    sequence: u32,
    values: BTreeMap<u8, Vec<u8>>,
}

impl Meta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the current copy out of the partition contents.
    pub fn decode(buf: &[u8]) -> Self {
        let copies = [
            buf.get(..COPY_SIZE),
            buf.get(COPY_SIZE..2 * COPY_SIZE),
        ];

        copies
            .into_iter()
            .enumerate()
            .filter_map(|(i, copy)| {
                let copy = copy?;
                match decode_copy(copy) {
                    Ok(meta) => Some(meta),
                    Err(err) => {
                        debug!("META copy {} is not valid: {}", i, err);
                        None
                    }
                }
            })
            .max_by_key(|meta| meta.sequence)
            .unwrap_or_default()
    }

    pub fn load(dev: &BlockDevice) -> Result<Self> {
        Self::load_at(dev, 0)
    }

    /// Load from a partition starting `offset` bytes into `dev`.
    pub fn load_at(dev: &BlockDevice, offset: u64) -> Result<Self> {
        let buf = dev.read_up_to(offset, 2 * COPY_SIZE)?;
        Ok(Self::decode(&buf))
    }

    pub fn read_tag(&self, tag: u8) -> Option<&[u8]> {
        self.values.get(&tag).map(Vec::as_slice)
    }

    pub fn tags(&self) -> impl Iterator<Item = (u8, &[u8])> {
        self.values.iter().map(|(tag, value)| (*tag, value.as_slice()))
    }

    /// Set `tag`; returns false when the stored value is already equal.
    pub fn set_tag(&mut self, tag: u8, value: &[u8]) -> Result<bool> {
        if tag == TAG_END {
            return Err(SysError::OperationFailed("META tag 0 is reserved".to_string()));
        }
        if value.len() > u16::MAX as usize {
            return Err(SysError::OperationFailed(format!(
                "META value for tag {:#04x} is too large ({} bytes)",
                tag,
                value.len()
            )));
        }
        if self.read_tag(tag) == Some(value) {
            return Ok(false);
        }

        let previous = self.values.insert(tag, value.to_vec());
        if self.payload_len() > COPY_SIZE - HEADER_LEN - TRAILER_LEN - 1 {
            match previous {
                Some(previous) => self.values.insert(tag, previous),
                None => self.values.remove(&tag),
            };
            return Err(SysError::OperationFailed("META is full".to_string()));
        }

        Ok(true)
    }

    pub fn delete_tag(&mut self, tag: u8) -> bool {
        self.values.remove(&tag).is_some()
    }

    fn payload_len(&self) -> usize {
        self.values.values().map(|v| 3 + v.len()).sum()
    }

    /// One encoded copy carrying `sequence`.
    fn encode(&self, sequence: u32) -> Vec<u8> {
        let mut buf = vec![0u8; COPY_SIZE];
        buf[0..4].copy_from_slice(&MAGIC1.to_be_bytes());
        buf[8..12].copy_from_slice(&sequence.to_be_bytes());

        let mut at = HEADER_LEN;
        for (tag, value) in &self.values {
            buf[at] = *tag;
            buf[at + 1..at + 3].copy_from_slice(&(value.len() as u16).to_be_bytes());
            buf[at + 3..at + 3 + value.len()].copy_from_slice(value);
            at += 3 + value.len();
        }
        buf[at] = TAG_END;

        buf[COPY_SIZE - TRAILER_LEN..].copy_from_slice(&MAGIC2.to_be_bytes());
        let crc = crc32fast::hash(&buf[8..COPY_SIZE - TRAILER_LEN]);
        buf[4..8].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Write both copies with a bumped sequence.
    pub fn flush(&mut self, dev: &BlockDevice) -> Result<()> {
        let size = dev.size()?;
        self.flush_at(dev, 0, size)
    }

    /// Like [`Meta::flush`], for a `size`-byte partition at `offset` of `dev`.
    pub fn flush_at(&mut self, dev: &BlockDevice, offset: u64, size: u64) -> Result<()> {
        if size < 2 * COPY_SIZE as u64 {
            return Err(SysError::OperationFailed(format!(
                "{} is too small for META ({} bytes)",
                dev.path(),
                size
            )));
        }

        let sequence = self.sequence.wrapping_add(1);
        let copy = self.encode(sequence);

        dev.write_at(offset + COPY_SIZE as u64, &copy)?;
        dev.sync()?;
        dev.write_at(offset, &copy)?;
        dev.sync()?;

        self.sequence = sequence;
        Ok(())
    }
}

fn decode_copy(copy: &[u8]) -> Result<Meta> {
    let be32 = |at: usize| u32::from_be_bytes([copy[at], copy[at + 1], copy[at + 2], copy[at + 3]]);

    if copy.len() < COPY_SIZE || be32(0) != MAGIC1 || be32(COPY_SIZE - TRAILER_LEN) != MAGIC2 {
        return Err(SysError::Parse("bad magic".to_string()));
    }
    if crc32fast::hash(&copy[8..COPY_SIZE - TRAILER_LEN]) != be32(4) {
        return Err(SysError::Parse("checksum mismatch".to_string()));
    }

    let mut values = BTreeMap::new();
    let end = COPY_SIZE - TRAILER_LEN;
    let mut at = HEADER_LEN;
    while at < end && copy[at] != TAG_END {
        if at + 3 > end {
            return Err(SysError::Parse("truncated entry".to_string()));
        }
        let tag = copy[at];
        let len = u16::from_be_bytes([copy[at + 1], copy[at + 2]]) as usize;
        if at + 3 + len > end {
            return Err(SysError::Parse(format!("value of tag {:#04x} overruns the copy", tag)));
        }
        values.insert(tag, copy[at + 3..at + 3 + len].to_vec());
        at += 3 + len;
    }

    Ok(Meta {
        sequence: be32(8),
        values,
    })
}

/// [`MetaStore`] opening the META partition for every access.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMeta;

impl MetaStore for SystemMeta {
    fn read_tag(&self, dev_path: &str, tag: u8) -> VolumeResult<Option<Vec<u8>>> {
        let dev = BlockDevice::open_shared(dev_path)?;
        Ok(Meta::load(&dev)?.read_tag(tag).map(<[u8]>::to_vec))
    }

    fn set_tag(&self, dev_path: &str, tag: u8, value: &[u8]) -> VolumeResult<bool> {
        let dev = BlockDevice::open_exclusive(dev_path)?;
        let mut meta = Meta::load(&dev)?;
        if !meta.set_tag(tag, value)? {
            return Ok(false);
        }
        meta.flush(&dev)?;
        info!("META tag {:#04x} updated on {}", tag, dev_path);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage_types::MIB;

    fn meta_image() -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(MIB).unwrap();
        file
    }

    #[test]
    fn blank_partition_is_empty() {
        let img = meta_image();
        let dev = BlockDevice::open_shared(img.path().to_str().unwrap()).unwrap();
        assert_eq!(Meta::load(&dev).unwrap(), Meta::new());
    }

    #[test]
    fn values_survive_a_flush() {
        let img = meta_image();
        let dev = BlockDevice::open_exclusive(img.path().to_str().unwrap()).unwrap();

        let mut meta = Meta::new();
        assert!(meta.set_tag(0x0d, br#"{"provider":"luks2"}"#).unwrap());
        assert!(meta.set_tag(0x06, b"v1.9.0").unwrap());
        meta.flush(&dev).unwrap();

        let loaded = Meta::load(&dev).unwrap();
        assert_eq!(loaded.read_tag(0x0d), Some(&br#"{"provider":"luks2"}"#[..]));
        assert_eq!(loaded.read_tag(0x06), Some(&b"v1.9.0"[..]));
        assert_eq!(loaded.tags().count(), 2);
    }

    #[test]
    fn setting_an_equal_value_is_not_a_change() {
        let mut meta = Meta::new();
        assert!(meta.set_tag(0x0a, b"x").unwrap());
        assert!(!meta.set_tag(0x0a, b"x").unwrap());
        assert!(meta.set_tag(0x0a, b"y").unwrap());
        assert!(meta.set_tag(0, b"z").is_err());
    }

    #[test]
    fn newest_valid_copy_wins() {
        let mut older = Meta::new();
        older.set_tag(0x0a, b"old").unwrap();
        let mut newer = older.clone();
        newer.set_tag(0x0a, b"new").unwrap();

        let mut buf = older.encode(1);
        buf.extend(newer.encode(2));
        assert_eq!(Meta::decode(&buf).read_tag(0x0a), Some(&b"new"[..]));

        // a torn write of the newer copy leaves the older one in charge
        buf[COPY_SIZE + HEADER_LEN] ^= 0xff;
        assert_eq!(Meta::decode(&buf).read_tag(0x0a), Some(&b"old"[..]));
    }

    #[test]
    fn store_updates_in_place() {
        let img = meta_image();
        let path = img.path().to_str().unwrap();

        assert_eq!(SystemMeta.read_tag(path, 0x0d).unwrap(), None);
        assert!(SystemMeta.set_tag(path, 0x0d, b"cfg").unwrap());
        assert!(!SystemMeta.set_tag(path, 0x0d, b"cfg").unwrap());
        assert_eq!(SystemMeta.read_tag(path, 0x0d).unwrap(), Some(b"cfg".to_vec()));
    }

    #[test]
    fn partition_inside_a_disk_image() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(4 * MIB).unwrap();
        let dev = BlockDevice::open_exclusive(file.path().to_str().unwrap()).unwrap();

        let mut meta = Meta::new();
        meta.set_tag(0x0a, b"seed").unwrap();
        assert!(meta.flush_at(&dev, 2 * MIB, 256 * 1024).is_err());
        meta.flush_at(&dev, 2 * MIB, MIB).unwrap();

        assert_eq!(Meta::load(&dev).unwrap(), Meta::new());
        let loaded = Meta::load_at(&dev, 2 * MIB).unwrap();
        assert_eq!(loaded.read_tag(0x0a), Some(&b"seed"[..]));
    }
}
