// SPDX-License-Identifier: GPL-3.0-only

//! Signature erasure.

use storage_types::MIB;
use tracing::debug;

use crate::Result;
use crate::blockdev::BlockDevice;

/// Bytes zeroed at each end of a device by [`fast_wipe`].
pub const FAST_WIPE_RANGE: u64 = MIB;

const CHUNK: usize = MIB as usize;

/// Zero the first and last [`FAST_WIPE_RANGE`] of `dev`.
///
/// That covers every superblock and both GPT copies, so the device probes
/// as empty afterwards.
pub fn fast_wipe(dev: &BlockDevice) -> Result<()> {
    let size = dev.size()?;
    debug!("fast wiping {} ({} bytes)", dev.path(), size);

    wipe_range(dev, 0, size.min(FAST_WIPE_RANGE))?;
    if size > FAST_WIPE_RANGE {
        let tail = size.saturating_sub(FAST_WIPE_RANGE).max(FAST_WIPE_RANGE);
        wipe_range(dev, tail, size - tail)?;
    }

    dev.sync()
}

/// Zero the whole device.
pub fn wipe(dev: &BlockDevice) -> Result<()> {
    let size = dev.size()?;
    debug!("wiping {} ({} bytes)", dev.path(), size);
    wipe_range(dev, 0, size)?;
    dev.sync()
}

pub fn wipe_range(dev: &BlockDevice, offset: u64, length: u64) -> Result<()> {
    let zeroes = vec![0u8; CHUNK];
    let mut done = 0u64;

    while done < length {
        let n = (length - done).min(CHUNK as u64) as usize;
        dev.write_at(offset + done, &zeroes[..n])?;
        done += n as u64;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileExt;

    #[test]
    fn fast_wipe_clears_both_ends_only() {
        let img = tempfile::NamedTempFile::new().unwrap();
        let size = 4 * MIB;
        img.as_file().write_all_at(&vec![0xaa; size as usize], 0).unwrap();

        let dev = BlockDevice::open_exclusive(img.path().to_str().unwrap()).unwrap();
        fast_wipe(&dev).unwrap();

        let mut head = vec![0u8; MIB as usize];
        dev.read_at(0, &mut head).unwrap();
        assert!(head.iter().all(|&b| b == 0));

        let mut tail = vec![0u8; MIB as usize];
        dev.read_at(3 * MIB, &mut tail).unwrap();
        assert!(tail.iter().all(|&b| b == 0));

        let mut middle = [0u8; 16];
        dev.read_at(2 * MIB, &mut middle).unwrap();
        assert_eq!(middle, [0xaa; 16]);
    }

    #[test]
    fn small_devices_are_wiped_entirely() {
        let img = tempfile::NamedTempFile::new().unwrap();
        img.as_file().write_all_at(&[0x55; 4096], 0).unwrap();

        let dev = BlockDevice::open_exclusive(img.path().to_str().unwrap()).unwrap();
        fast_wipe(&dev).unwrap();

        let mut buf = [0u8; 4096];
        dev.read_at(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(dev.size().unwrap(), 4096);
    }
}
