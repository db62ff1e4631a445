// SPDX-License-Identifier: GPL-3.0-only

//! Superblock and partition table detection.
//!
//! Probing never writes. Partitions are probed through the parent disk at
//! their GPT offsets, so a freshly written partition is visible before the
//! kernel has created its device node.

use storage_contracts::{
    DeviceProbe, DeviceProber, DeviceScanner, ProbeResult, ProbedPartition, VolumeResult,
};
use tracing::debug;
use uuid::Uuid;

use crate::blockdev::BlockDevice;
use crate::gpt::{self, Gpt};
use crate::Result;

/// A byte range of a device.
struct Window<'a> {
    dev: &'a BlockDevice,
    offset: u64,
    size: u64,
}

impl Window<'_> {
    /// Up to `len` bytes at `at`; short (or empty) past the end of the window.
    fn read(&self, at: u64, len: usize) -> Result<Vec<u8>> {
        if at >= self.size {
            return Ok(Vec::new());
        }
        let len = len.min((self.size - at) as usize);
        self.dev.read_up_to(self.offset + at, len)
    }
}

type Prober = fn(&Window<'_>) -> Result<Option<ProbeResult>>;

const PROBERS: &[(&str, Prober)] = &[
    ("luks", probe_luks),
    ("xfs", probe_xfs),
    ("ext4", probe_ext),
    ("squashfs", probe_squashfs),
    ("swap", probe_swap),
    ("lvm2-pv", probe_lvm2),
    ("iso9660", probe_iso9660),
    ("zfs", probe_zfs),
    ("vfat", probe_vfat),
];

/// Open `dev_path` under a shared lock and probe it.
///
/// A lock timeout surfaces as [`crate::SysError::LockTimeout`].
pub fn probe_device(dev_path: &str) -> Result<DeviceProbe> {
    let dev = BlockDevice::open_shared(dev_path)?;
    probe_open_device(&dev)
}

pub fn probe_open_device(dev: &BlockDevice) -> Result<DeviceProbe> {
    let size = dev.size()?;
    let sector_size = dev.sector_size();
    let io_size = dev.io_size();

    let whole = Window {
        dev,
        offset: 0,
        size,
    };

    let mut content = probe_content(&whole, sector_size)?;
    content.size = size;

    let mut partitions = Vec::new();
    if content.name == "gpt" {
        match Gpt::read(dev)? {
            Some(table) => {
                for (number, entry) in table.partitions() {
                    let offset = entry.offset(sector_size);
                    let part_size = entry.size(sector_size);
                    let window = Window {
                        dev,
                        offset,
                        size: part_size,
                    };

                    let mut inner = probe_content(&window, sector_size)?;
                    inner.size = part_size;

                    partitions.push(ProbedPartition {
                        number,
                        dev_path: partition_dev_path(dev.path(), number),
                        partition_uuid: entry.uuid_string(),
                        partition_type: entry.type_string(),
                        partition_label: entry.name.clone(),
                        offset,
                        size: part_size,
                        content: inner,
                    });
                }
            }
            None => debug!("{} has a GPT signature but no readable table", dev.path()),
        }
    }

    Ok(DeviceProbe {
        size,
        sector_size,
        io_size,
        content,
        partitions,
    })
}

fn probe_content(window: &Window<'_>, sector_size: u64) -> Result<ProbeResult> {
    if window.offset == 0 && gpt::has_signature(&window.read(sector_size, 8)?) {
        return Ok(ProbeResult {
            name: "gpt".to_string(),
            ..Default::default()
        });
    }

    for (name, prober) in PROBERS {
        if let Some(mut result) = prober(window)? {
            result.name = name.to_string();
            return Ok(result);
        }
    }

    Ok(ProbeResult::default())
}

/// Device node of partition `number` of `disk`: `sda` → `sda1`, `nvme0n1` → `nvme0n1p1`.
pub fn partition_dev_path(disk: &str, number: u32) -> String {
    if disk.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{}p{}", disk, number)
    } else {
        format!("{}{}", disk, number)
    }
}

fn text(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).trim_end().to_string()
}

fn uuid_be(buf: &[u8]) -> String {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&buf[..16]);
    Uuid::from_bytes(bytes).hyphenated().to_string()
}

fn be32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn le16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn le32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn be64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(b)
}

fn le64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

const LUKS_MAGIC: &[u8; 6] = b"LUKS\xba\xbe";

fn probe_luks(w: &Window<'_>) -> Result<Option<ProbeResult>> {
    let buf = w.read(0, 512)?;
    if buf.len() < 512 || &buf[0..6] != LUKS_MAGIC {
        return Ok(None);
    }

    let version = u16::from_be_bytes([buf[6], buf[7]]);
    let label = if version == 2 { text(&buf[24..72]) } else { String::new() };

    Ok(Some(ProbeResult {
        uuid: text(&buf[168..208]),
        label,
        ..Default::default()
    }))
}

fn probe_xfs(w: &Window<'_>) -> Result<Option<ProbeResult>> {
    let buf = w.read(0, 512)?;
    if buf.len() < 120 || &buf[0..4] != b"XFSB" {
        return Ok(None);
    }

    let block_size = u64::from(be32(&buf, 4));
    let blocks = be64(&buf, 8);

    Ok(Some(ProbeResult {
        uuid: uuid_be(&buf[32..48]),
        label: text(&buf[108..120]),
        block_size,
        probed_size: blocks * block_size,
        ..Default::default()
    }))
}

const EXT_SUPERBLOCK: u64 = 1024;
const EXT_MAGIC: u16 = 0xef53;
const EXT4_FEATURE_INCOMPAT_64BIT: u32 = 0x80;

fn probe_ext(w: &Window<'_>) -> Result<Option<ProbeResult>> {
    let sb = w.read(EXT_SUPERBLOCK, 1024)?;
    if sb.len() < 1024 || le16(&sb, 56) != EXT_MAGIC {
        return Ok(None);
    }

    let block_size = 1024u64 << le32(&sb, 24).min(16);
    let mut blocks = u64::from(le32(&sb, 4));
    if le32(&sb, 0x60) & EXT4_FEATURE_INCOMPAT_64BIT != 0 {
        blocks |= u64::from(le32(&sb, 0x150)) << 32;
    }

    Ok(Some(ProbeResult {
        uuid: uuid_be(&sb[104..120]),
        label: text(&sb[120..136]),
        block_size,
        probed_size: blocks * block_size,
        ..Default::default()
    }))
}

fn probe_squashfs(w: &Window<'_>) -> Result<Option<ProbeResult>> {
    let buf = w.read(0, 96)?;
    if buf.len() < 96 || &buf[0..4] != b"hsqs" {
        return Ok(None);
    }

    Ok(Some(ProbeResult {
        block_size: u64::from(le32(&buf, 12)),
        probed_size: le64(&buf, 40),
        ..Default::default()
    }))
}

const SWAP_PAGE_SIZES: &[u64] = &[4096, 8192, 16384, 65536];

fn probe_swap(w: &Window<'_>) -> Result<Option<ProbeResult>> {
    for &page in SWAP_PAGE_SIZES {
        let magic = w.read(page - 10, 10)?;
        if magic.as_slice() != b"SWAPSPACE2" {
            continue;
        }

        let header = w.read(1024, 44)?;
        if header.len() < 44 {
            return Ok(None);
        }

        let last_page = u64::from(le32(&header, 4));
        return Ok(Some(ProbeResult {
            uuid: uuid_be(&header[12..28]),
            label: text(&header[28..44]),
            block_size: page,
            probed_size: (last_page + 1) * page,
            ..Default::default()
        }));
    }

    Ok(None)
}

fn probe_lvm2(w: &Window<'_>) -> Result<Option<ProbeResult>> {
    for sector in 0..4u64 {
        let buf = w.read(sector * 512, 512)?;
        if buf.len() < 64 || &buf[0..8] != b"LABELONE" || &buf[24..32] != b"LVM2 001" {
            continue;
        }

        let raw = text(&buf[32..64]);
        return Ok(Some(ProbeResult {
            uuid: format_lvm_uuid(&raw),
            ..Default::default()
        }));
    }

    Ok(None)
}

/// LVM prints its 32-character ids in 6-4-4-4-4-4-6 groups.
fn format_lvm_uuid(raw: &str) -> String {
    if raw.len() != 32 {
        return raw.to_string();
    }

    let mut out = String::with_capacity(38);
    let mut at = 0;
    for (i, width) in [6, 4, 4, 4, 4, 4, 6].into_iter().enumerate() {
        if i > 0 {
            out.push('-');
        }
        out.push_str(&raw[at..at + width]);
        at += width;
    }
    out
}

const ISO_DESCRIPTOR: u64 = 0x8000;

fn probe_iso9660(w: &Window<'_>) -> Result<Option<ProbeResult>> {
    let pvd = w.read(ISO_DESCRIPTOR, 2048)?;
    if pvd.len() < 2048 || &pvd[1..6] != b"CD001" {
        return Ok(None);
    }

    let block_size = u64::from(le16(&pvd, 128));
    let blocks = u64::from(le32(&pvd, 80));

    Ok(Some(ProbeResult {
        label: text(&pvd[40..72]),
        block_size,
        probed_size: blocks * block_size,
        ..Default::default()
    }))
}

const ZFS_UBERBLOCK_OFFSET: u64 = 128 * 1024;
const ZFS_UBERBLOCK_MAGIC: u64 = 0x00ba_b10c;

fn probe_zfs(w: &Window<'_>) -> Result<Option<ProbeResult>> {
    let buf = w.read(ZFS_UBERBLOCK_OFFSET, 8)?;
    if buf.len() < 8 {
        return Ok(None);
    }

    if le64(&buf, 0) == ZFS_UBERBLOCK_MAGIC || be64(&buf, 0) == ZFS_UBERBLOCK_MAGIC {
        return Ok(Some(ProbeResult::default()));
    }
    Ok(None)
}

fn probe_vfat(w: &Window<'_>) -> Result<Option<ProbeResult>> {
    let bs = w.read(0, 512)?;
    if bs.len() < 512 || bs[510] != 0x55 || bs[511] != 0xaa {
        return Ok(None);
    }

    let (serial_at, label_at) = if &bs[82..87] == b"FAT32" {
        (67, 71)
    } else if &bs[54..59] == b"FAT12" || &bs[54..59] == b"FAT16" {
        (39, 43)
    } else {
        return Ok(None);
    };

    let sector = u64::from(le16(&bs, 11));
    let cluster = u64::from(bs[13]);
    let total = match le16(&bs, 19) {
        0 => u64::from(le32(&bs, 32)),
        small => u64::from(small),
    };

    let serial = le32(&bs, serial_at);
    let label = text(&bs[label_at..label_at + 11]);

    Ok(Some(ProbeResult {
        uuid: format!("{:04X}-{:04X}", serial >> 16, serial & 0xffff),
        label: if label == "NO NAME" { String::new() } else { label },
        block_size: sector * cluster,
        probed_size: total * sector,
        ..Default::default()
    }))
}

/// [`DeviceProber`] over real device nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProber;

impl DeviceProber for SystemProber {
    fn probe(&self, dev_path: &str) -> VolumeResult<ProbeResult> {
        Ok(probe_device(dev_path)?.content)
    }
}

impl DeviceScanner for SystemProber {
    fn scan(&self, dev_path: &str) -> VolumeResult<DeviceProbe> {
        Ok(probe_device(dev_path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage_types::MIB;
    use storage_types::partition_types::LINUX_FILESYSTEM;

    fn image(size: u64) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(size).unwrap();
        file
    }

    fn write(img: &tempfile::NamedTempFile, offset: u64, bytes: &[u8]) {
        use std::os::unix::fs::FileExt;
        img.as_file().write_all_at(bytes, offset).unwrap();
    }

    #[test]
    fn blank_device_probes_empty() {
        let img = image(4 * MIB);
        let probe = probe_device(img.path().to_str().unwrap()).unwrap();
        assert!(probe.content.is_empty());
        assert_eq!(probe.size, 4 * MIB);
        assert!(probe.partitions.is_empty());
    }

    #[test]
    fn detects_xfs() {
        let img = image(4 * MIB);
        let mut sb = vec![0u8; 512];
        sb[0..4].copy_from_slice(b"XFSB");
        sb[4..8].copy_from_slice(&4096u32.to_be_bytes());
        sb[8..16].copy_from_slice(&1024u64.to_be_bytes());
        sb[32..48].copy_from_slice(&[0x11; 16]);
        sb[108..113].copy_from_slice(b"STATE");
        write(&img, 0, &sb);

        let probe = probe_device(img.path().to_str().unwrap()).unwrap();
        assert_eq!(probe.content.name, "xfs");
        assert_eq!(probe.content.label, "STATE");
        assert_eq!(probe.content.uuid, "11111111-1111-1111-1111-111111111111");
        assert_eq!(probe.content.probed_size, 4 * MIB);
    }

    #[test]
    fn detects_luks2() {
        let img = image(4 * MIB);
        let mut hdr = vec![0u8; 512];
        hdr[0..6].copy_from_slice(LUKS_MAGIC);
        hdr[6..8].copy_from_slice(&2u16.to_be_bytes());
        hdr[168..204].copy_from_slice(b"6a2c3e0e-1c2b-4b0a-9d7e-5a4f3b2c1d0e");
        write(&img, 0, &hdr);

        let probe = probe_device(img.path().to_str().unwrap()).unwrap();
        assert_eq!(probe.content.name, "luks");
        assert_eq!(probe.content.uuid, "6a2c3e0e-1c2b-4b0a-9d7e-5a4f3b2c1d0e");
    }

    #[test]
    fn detects_swap() {
        let img = image(4 * MIB);
        write(&img, 4096 - 10, b"SWAPSPACE2");
        let mut header = vec![0u8; 44];
        header[4..8].copy_from_slice(&1023u32.to_le_bytes());
        header[28..32].copy_from_slice(b"swap");
        write(&img, 1024, &header);

        let probe = probe_device(img.path().to_str().unwrap()).unwrap();
        assert_eq!(probe.content.name, "swap");
        assert_eq!(probe.content.label, "swap");
        assert_eq!(probe.content.probed_size, 4 * MIB);
    }

    #[test]
    fn detects_lvm_physical_volume() {
        let img = image(4 * MIB);
        let mut label = vec![0u8; 64];
        label[0..8].copy_from_slice(b"LABELONE");
        label[24..32].copy_from_slice(b"LVM2 001");
        label[32..64].copy_from_slice(b"abcdefghijklmnopqrstuvwxyz012345");
        write(&img, 512, &label);

        let probe = probe_device(img.path().to_str().unwrap()).unwrap();
        assert_eq!(probe.content.name, "lvm2-pv");
        assert_eq!(probe.content.uuid, "abcdef-ghij-klmn-opqr-stuv-wxyz-012345");
    }

    #[test]
    fn partitions_are_probed_through_the_disk() {
        let img = image(64 * MIB);
        let path = img.path().to_str().unwrap();
        {
            let dev = BlockDevice::open_exclusive(path).unwrap();
            let mut table = Gpt::new(dev.size().unwrap(), 512).unwrap();
            let fs = Uuid::parse_str(LINUX_FILESYSTEM).unwrap();
            table.allocate(MIB, "META", fs).unwrap();
            table.allocate(8 * MIB, "STATE", fs).unwrap();
            table.write(&dev).unwrap();
        }

        write(&img, 2 * MIB, b"XFSB");

        let probe = probe_device(path).unwrap();
        assert_eq!(probe.content.name, "gpt");
        assert_eq!(probe.partitions.len(), 2);

        let meta = &probe.partitions[0];
        assert_eq!(meta.partition_label, "META");
        assert_eq!(meta.size, MIB);
        assert!(meta.content.is_empty());
        assert_eq!(meta.dev_path, partition_dev_path(path, 1));

        let state = &probe.partitions[1];
        assert_eq!(state.offset, 2 * MIB);
        assert_eq!(state.content.name, "xfs");
        assert_eq!(state.partition_type, LINUX_FILESYSTEM);
    }

    #[test]
    fn partition_node_names() {
        assert_eq!(partition_dev_path("/dev/sda", 2), "/dev/sda2");
        assert_eq!(partition_dev_path("/dev/nvme0n1", 3), "/dev/nvme0n1p3");
        assert_eq!(partition_dev_path("/dev/loop0", 1), "/dev/loop0p1");
    }
}
