// SPDX-License-Identifier: GPL-3.0-only

//! In-place GUID partition table editing.
//!
//! Only what the volume engine needs: read (primary, falling back to the
//! backup copy), create, allocate into free space, grow a partition into the
//! space after it, and write both copies plus the protective MBR.
//!
//! Partition starts are aligned to [`GPT_ALIGNMENT_BYTES`]. The table always
//! describes the device at its current size, so a table read from a disk that
//! has since grown is written back with its backup copy moved to the new end.

use std::collections::BTreeMap;

use storage_types::{GPT_ALIGNMENT_BYTES, MIB};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::blockdev::BlockDevice;
use crate::{Result, SysError};

pub const SIGNATURE: &[u8; 8] = b"EFI PART";
const REVISION: u32 = 0x0001_0000;
const HEADER_SIZE: u32 = 92;
const ENTRY_COUNT: u32 = 128;
const ENTRY_SIZE: u32 = 128;
const ENTRY_NAME_UNITS: usize = 36;

/// Sectors a disk spends on GPT bookkeeping: protective MBR, two headers and
/// two 32-sector entry arrays at 512-byte sectors.
pub const GPT_RESERVED_SECTORS: u64 = 67;

/// Growth below this is not worth a table rewrite.
pub const MIN_GROWTH: u64 = MIB;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptPartition {
    pub type_guid: Uuid,
    pub part_guid: Uuid,
    pub first_lba: u64,
    /// Inclusive.
    pub last_lba: u64,
    pub attributes: u64,
    pub name: String,
}

impl GptPartition {
    pub fn sectors(&self) -> u64 {
        self.last_lba - self.first_lba + 1
    }

    pub fn size(&self, sector_size: u64) -> u64 {
        self.sectors() * sector_size
    }

    pub fn offset(&self, sector_size: u64) -> u64 {
        self.first_lba * sector_size
    }

    /// Upper-case canonical type GUID.
    pub fn type_string(&self) -> String {
        self.type_guid.hyphenated().to_string().to_ascii_uppercase()
    }

    pub fn uuid_string(&self) -> String {
        self.part_guid.hyphenated().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gpt {
    disk_guid: Uuid,
    sector_size: u64,
    disk_size: u64,
    /// One slot per entry; partition number is slot index + 1.
    entries: Vec<Option<GptPartition>>,
}

struct Layout {
    entry_sectors: u64,
    last_lba: u64,
    first_usable: u64,
    last_usable: u64,
}

impl Gpt {
    /// Empty table for a disk of `disk_size` bytes.
    pub fn new(disk_size: u64, sector_size: u64) -> Result<Self> {
        let gpt = Self {
            disk_guid: Uuid::new_v4(),
            sector_size,
            disk_size,
            entries: vec![None; ENTRY_COUNT as usize],
        };
        gpt.layout()?;
        Ok(gpt)
    }

    /// Read the table of `dev`; `None` when the device carries no GPT.
    pub fn read(dev: &BlockDevice) -> Result<Option<Self>> {
        let disk_size = dev.size()?;
        let sector_size = dev.sector_size();
        let total_sectors = disk_size / sector_size;
        if total_sectors < GPT_RESERVED_SECTORS {
            return Ok(None);
        }

        match read_copy(dev, 1, sector_size) {
            Ok(Some(parsed)) => return Self::from_parsed(parsed, disk_size, sector_size).map(Some),
            Ok(None) => {}
            Err(err) => warn!("primary GPT of {} is invalid: {}", dev.path(), err),
        }

        // The backup lives at the last sector of the disk the table was written for;
        // that is only the current last sector when the disk did not grow.
        match read_copy(dev, total_sectors - 1, sector_size) {
            Ok(Some(parsed)) => {
                debug!("using backup GPT of {}", dev.path());
                Self::from_parsed(parsed, disk_size, sector_size).map(Some)
            }
            Ok(None) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn from_parsed(parsed: ParsedTable, disk_size: u64, sector_size: u64) -> Result<Self> {
        let gpt = Self {
            disk_guid: parsed.disk_guid,
            sector_size,
            disk_size,
            entries: parsed.entries,
        };

        let layout = gpt.layout()?;
        for (number, partition) in gpt.partitions() {
            if partition.first_lba > partition.last_lba {
                return Err(SysError::PartitionTable(format!(
                    "partition {} ends before it starts",
                    number
                )));
            }
            if partition.first_lba < layout.first_usable || partition.last_lba > layout.last_usable {
                return Err(SysError::PartitionTable(format!(
                    "partition {} lies outside the usable area of the disk",
                    number
                )));
            }
        }

        Ok(gpt)
    }

    pub fn disk_guid(&self) -> Uuid {
        self.disk_guid
    }

    pub fn sector_size(&self) -> u64 {
        self.sector_size
    }

    pub fn disk_size(&self) -> u64 {
        self.disk_size
    }

    /// Partitions with their 1-based numbers, in entry order.
    pub fn partitions(&self) -> impl Iterator<Item = (u32, &GptPartition)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| entry.as_ref().map(|p| (slot as u32 + 1, p)))
    }

    pub fn partition(&self, number: u32) -> Option<&GptPartition> {
        let slot = number.checked_sub(1)? as usize;
        self.entries.get(slot)?.as_ref()
    }

    /// Replace the attribute bits of partition `number`.
    pub fn set_attributes(&mut self, number: u32, attributes: u64) -> Result<()> {
        let entry = number
            .checked_sub(1)
            .and_then(|slot| self.entries.get_mut(slot as usize))
            .and_then(Option::as_mut)
            .ok_or_else(|| SysError::PartitionTable(format!("no partition {}", number)))?;
        entry.attributes = attributes;
        Ok(())
    }

    /// Entries in the on-disk array; at least the usual 128, more when the
    /// table was read that way.
    fn entry_count(&self) -> u32 {
        u32::try_from(self.entries.len())
            .unwrap_or(u32::MAX)
            .max(ENTRY_COUNT)
    }

    fn layout(&self) -> Result<Layout> {
        let entry_bytes = u64::from(self.entry_count()) * u64::from(ENTRY_SIZE);
        let entry_sectors = entry_bytes.div_ceil(self.sector_size);
        let total = self.disk_size / self.sector_size;
        let overhead = 3 + 2 * entry_sectors;

        if total <= overhead {
            return Err(SysError::PartitionTable(format!(
                "disk of {} bytes is too small for a partition table",
                self.disk_size
            )));
        }

        let last_lba = total - 1;
        Ok(Layout {
            entry_sectors,
            last_lba,
            first_usable: 2 + entry_sectors,
            last_usable: last_lba - entry_sectors - 1,
        })
    }

    fn alignment_sectors(&self) -> u64 {
        (GPT_ALIGNMENT_BYTES / self.sector_size).max(1)
    }

    /// Free extents as inclusive `(first, last)` LBAs, starts aligned.
    fn free_extents(&self) -> Result<Vec<(u64, u64)>> {
        let layout = self.layout()?;
        let align = self.alignment_sectors();

        let used: BTreeMap<u64, u64> = self
            .partitions()
            .map(|(_, p)| (p.first_lba, p.last_lba))
            .collect();

        let mut extents = Vec::new();
        let mut cursor = layout.first_usable;
        let mut push = |start: u64, end: u64| {
            let aligned = start.div_ceil(align) * align;
            if aligned <= end {
                extents.push((aligned, end));
            }
        };

        for (&first, &last) in &used {
            if first > cursor {
                push(cursor, first - 1);
            }
            cursor = cursor.max(last + 1);
        }
        if cursor <= layout.last_usable {
            push(cursor, layout.last_usable);
        }

        Ok(extents)
    }

    /// Size in bytes of the largest extent a new partition could occupy.
    pub fn largest_contiguous_allocatable(&self) -> u64 {
        self.free_extents()
            .unwrap_or_default()
            .iter()
            .map(|(first, last)| (last - first + 1) * self.sector_size)
            .max()
            .unwrap_or(0)
    }

    /// Add a partition of `size` bytes (zero: the largest free extent).
    ///
    /// Sized partitions go into the first extent that fits. Returns the new
    /// partition number.
    pub fn allocate(&mut self, size: u64, label: &str, type_guid: Uuid) -> Result<u32> {
        let slot = self
            .entries
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| SysError::PartitionTable("no free partition entries".to_string()))?;

        let extents = self.free_extents()?;
        let candidate = if size == 0 {
            extents
                .iter()
                .max_by_key(|(first, last)| last - first)
                .map(|&(first, last)| (first, last))
        } else {
            let sectors = size.div_ceil(self.sector_size);
            extents
                .iter()
                .find(|(first, last)| last - first + 1 >= sectors)
                .map(|&(first, _)| (first, first + sectors - 1))
        };
        let (first, last) = candidate.ok_or_else(|| {
            SysError::PartitionTable(format!(
                "requested partition size {} is too big, largest available is {}",
                size,
                self.largest_contiguous_allocatable()
            ))
        })?;

        self.entries[slot] = Some(GptPartition {
            type_guid,
            part_guid: Uuid::new_v4(),
            first_lba: first,
            last_lba: last,
            attributes: 0,
            name: label.to_string(),
        });

        Ok(slot as u32 + 1)
    }

    /// Bytes partition `number` could grow by without moving anything.
    pub fn available_partition_growth(&self, number: u32) -> Result<u64> {
        let partition = self
            .partition(number)
            .ok_or_else(|| SysError::PartitionTable(format!("partition {} not found", number)))?;
        let layout = self.layout()?;

        let next_start = self
            .partitions()
            .map(|(_, p)| p.first_lba)
            .filter(|&first| first > partition.last_lba)
            .min()
            .unwrap_or(layout.last_usable + 1);

        Ok((next_start - partition.last_lba - 1) * self.sector_size)
    }

    /// Extend partition `number` by `grow_by` bytes (rounded down to sectors).
    pub fn grow_partition(&mut self, number: u32, grow_by: u64) -> Result<()> {
        let available = self.available_partition_growth(number)?;
        if grow_by > available {
            return Err(SysError::PartitionTable(format!(
                "cannot grow partition {} by {}, only {} available",
                number, grow_by, available
            )));
        }

        let sectors = grow_by / self.sector_size;
        if let Some(Some(partition)) = self.entries.get_mut(number as usize - 1) {
            partition.last_lba += sectors;
        }
        Ok(())
    }

    fn entries_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.entry_count() as usize * ENTRY_SIZE as usize];
        for (slot, entry) in self.entries.iter().enumerate() {
            let Some(p) = entry else { continue };
            let e = &mut buf[slot * ENTRY_SIZE as usize..(slot + 1) * ENTRY_SIZE as usize];
            e[0..16].copy_from_slice(&p.type_guid.to_bytes_le());
            e[16..32].copy_from_slice(&p.part_guid.to_bytes_le());
            e[32..40].copy_from_slice(&p.first_lba.to_le_bytes());
            e[40..48].copy_from_slice(&p.last_lba.to_le_bytes());
            e[48..56].copy_from_slice(&p.attributes.to_le_bytes());
            for (i, unit) in p.name.encode_utf16().take(ENTRY_NAME_UNITS).enumerate() {
                e[56 + i * 2..58 + i * 2].copy_from_slice(&unit.to_le_bytes());
            }
        }
        buf
    }

    fn header_bytes(
        &self,
        layout: &Layout,
        current: u64,
        backup: u64,
        entries_lba: u64,
        entries_crc: u32,
    ) -> Vec<u8> {
        let mut h = vec![0u8; self.sector_size as usize];
        h[0..8].copy_from_slice(SIGNATURE);
        h[8..12].copy_from_slice(&REVISION.to_le_bytes());
        h[12..16].copy_from_slice(&HEADER_SIZE.to_le_bytes());
        h[24..32].copy_from_slice(&current.to_le_bytes());
        h[32..40].copy_from_slice(&backup.to_le_bytes());
        h[40..48].copy_from_slice(&layout.first_usable.to_le_bytes());
        h[48..56].copy_from_slice(&layout.last_usable.to_le_bytes());
        h[56..72].copy_from_slice(&self.disk_guid.to_bytes_le());
        h[72..80].copy_from_slice(&entries_lba.to_le_bytes());
        h[80..84].copy_from_slice(&self.entry_count().to_le_bytes());
        h[84..88].copy_from_slice(&ENTRY_SIZE.to_le_bytes());
        h[88..92].copy_from_slice(&entries_crc.to_le_bytes());
        let crc = crc32fast::hash(&h[..HEADER_SIZE as usize]);
        h[16..20].copy_from_slice(&crc.to_le_bytes());
        h
    }

    /// Protective MBR partition record, keeping any boot code in front of it.
    fn protective_mbr(&self, existing: &[u8], layout: &Layout) -> Vec<u8> {
        let mut mbr = vec![0u8; 512];
        mbr[..440].copy_from_slice(&existing[..440]);

        let record = &mut mbr[446..462];
        record[1] = 0x00;
        record[2] = 0x02;
        record[4] = 0xee;
        record[5..8].copy_from_slice(&[0xff, 0xff, 0xff]);
        record[8..12].copy_from_slice(&1u32.to_le_bytes());
        let length = u32::try_from(layout.last_lba).unwrap_or(u32::MAX);
        record[12..16].copy_from_slice(&length.to_le_bytes());

        mbr[510] = 0x55;
        mbr[511] = 0xaa;
        mbr
    }

    /// Write the protective MBR and both table copies, then fsync.
    pub fn write(&self, dev: &BlockDevice) -> Result<()> {
        let layout = self.layout()?;
        let ss = self.sector_size;

        let entries = self.entries_bytes();
        let entries_crc = crc32fast::hash(&entries);
        let backup_entries_lba = layout.last_lba - layout.entry_sectors;

        let mut existing = vec![0u8; 512];
        dev.read_at(0, &mut existing)?;
        dev.write_at(0, &self.protective_mbr(&existing, &layout))?;

        let primary = self.header_bytes(&layout, 1, layout.last_lba, 2, entries_crc);
        dev.write_at(ss, &primary)?;
        dev.write_at(2 * ss, &entries)?;

        let backup = self.header_bytes(&layout, layout.last_lba, 1, backup_entries_lba, entries_crc);
        dev.write_at(backup_entries_lba * ss, &entries)?;
        dev.write_at(layout.last_lba * ss, &backup)?;

        dev.sync()
    }
}

struct ParsedTable {
    disk_guid: Uuid,
    entries: Vec<Option<GptPartition>>,
}

fn read_copy(dev: &BlockDevice, lba: u64, sector_size: u64) -> Result<Option<ParsedTable>> {
    let mut header = vec![0u8; sector_size as usize];
    dev.read_at(lba * sector_size, &mut header)?;

    if &header[0..8] != SIGNATURE {
        return Ok(None);
    }

    let size = u32_at(&header, 12) as usize;
    if !(HEADER_SIZE as usize..=header.len()).contains(&size) {
        return Err(SysError::PartitionTable(format!("invalid header size {}", size)));
    }

    let stored_crc = u32_at(&header, 16);
    let mut check = header[..size].to_vec();
    check[16..20].fill(0);
    if crc32fast::hash(&check) != stored_crc {
        return Err(SysError::PartitionTable("header checksum mismatch".to_string()));
    }

    let entries_lba = u64_at(&header, 72);
    let count = u32_at(&header, 80) as usize;
    let entry_size = u32_at(&header, 84) as usize;
    if entry_size < ENTRY_SIZE as usize || count == 0 || count > 1024 {
        return Err(SysError::PartitionTable(format!(
            "unsupported entry layout {}x{}",
            count, entry_size
        )));
    }

    let mut raw = vec![0u8; count * entry_size];
    dev.read_at(entries_lba * sector_size, &mut raw)?;
    if crc32fast::hash(&raw) != u32_at(&header, 88) {
        return Err(SysError::PartitionTable("entries checksum mismatch".to_string()));
    }

    let mut entries = vec![None; ENTRY_COUNT.max(count as u32) as usize];
    for (slot, e) in raw.chunks_exact(entry_size).enumerate() {
        let type_guid = guid_at(e, 0);
        if type_guid.is_nil() {
            continue;
        }

        let units: Vec<u16> = e[56..56 + ENTRY_NAME_UNITS * 2]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0)
            .collect();

        entries[slot] = Some(GptPartition {
            type_guid,
            part_guid: guid_at(e, 16),
            first_lba: u64_at(e, 32),
            last_lba: u64_at(e, 40),
            attributes: u64_at(e, 48),
            name: String::from_utf16_lossy(&units),
        });
    }

    Ok(Some(ParsedTable {
        disk_guid: guid_at(&header, 56),
        entries,
    }))
}

fn u32_at(buf: &[u8], offset: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(b)
}

fn u64_at(buf: &[u8], offset: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(b)
}

fn guid_at(buf: &[u8], offset: usize) -> Uuid {
    let mut b = [0u8; 16];
    b.copy_from_slice(&buf[offset..offset + 16]);
    Uuid::from_bytes_le(b)
}

/// Whether `buf` (LBA 1 onwards) starts with a GPT header signature.
pub fn has_signature(buf: &[u8]) -> bool {
    buf.len() >= 8 && &buf[0..8] == SIGNATURE
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage_types::GIB;
    use storage_types::partition_types::{LINUX_FILESYSTEM, LINUX_SWAP};

    fn image(size: u64) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(size).unwrap();
        file
    }

    fn fs_type() -> Uuid {
        Uuid::parse_str(LINUX_FILESYSTEM).unwrap()
    }

    fn far_partition(first_lba: u64, last_lba: u64) -> GptPartition {
        GptPartition {
            type_guid: fs_type(),
            part_guid: Uuid::new_v4(),
            first_lba,
            last_lba,
            attributes: 0,
            name: "FAR".to_string(),
        }
    }

    #[test]
    fn tables_with_more_than_128_entries_survive_a_rewrite() {
        let img = image(64 * MIB);
        let dev = BlockDevice::open_exclusive(img.path().to_str().unwrap()).unwrap();

        let mut gpt = Gpt::new(dev.size().unwrap(), dev.sector_size()).unwrap();
        gpt.entries.resize(256, None);
        gpt.entries[199] = Some(far_partition(2048, 4095));
        gpt.write(&dev).unwrap();

        let mut read = Gpt::read(&dev).unwrap().unwrap();
        assert_eq!(read.entries.len(), 256);
        assert_eq!(read.partition(200).unwrap().name, "FAR");

        assert_eq!(read.allocate(MIB, "NEAR", fs_type()).unwrap(), 1);
        read.write(&dev).unwrap();
        let again = Gpt::read(&dev).unwrap().unwrap();
        assert_eq!(again, read);
    }

    #[test]
    fn inverted_partitions_are_rejected() {
        let img = image(64 * MIB);
        let dev = BlockDevice::open_exclusive(img.path().to_str().unwrap()).unwrap();

        let mut gpt = Gpt::new(dev.size().unwrap(), dev.sector_size()).unwrap();
        gpt.entries[0] = Some(far_partition(4095, 2048));
        gpt.write(&dev).unwrap();

        let err = Gpt::read(&dev).unwrap_err();
        assert!(err.to_string().contains("ends before it starts"), "{}", err);
    }

    #[test]
    fn blank_disk_has_no_table() {
        let img = image(64 * MIB);
        let dev = BlockDevice::open_shared(img.path().to_str().unwrap()).unwrap();
        assert!(Gpt::read(&dev).unwrap().is_none());
    }

    #[test]
    fn system_layout_on_blank_disk() {
        let img = image(8 * GIB);
        let dev = BlockDevice::open_exclusive(img.path().to_str().unwrap()).unwrap();

        let mut gpt = Gpt::new(dev.size().unwrap(), dev.sector_size()).unwrap();
        assert_eq!(gpt.allocate(MIB, "META", fs_type()).unwrap(), 1);
        assert_eq!(gpt.allocate(100 * MIB, "STATE", fs_type()).unwrap(), 2);
        assert_eq!(gpt.allocate(0, "EPHEMERAL", fs_type()).unwrap(), 3);
        gpt.write(&dev).unwrap();

        let read = Gpt::read(&dev).unwrap().unwrap();
        assert_eq!(read, gpt);

        let meta = read.partition(1).unwrap();
        assert_eq!(meta.offset(512), MIB);
        assert_eq!(meta.size(512), MIB);
        assert_eq!(meta.name, "META");
        assert_eq!(meta.type_string(), LINUX_FILESYSTEM);

        let state = read.partition(2).unwrap();
        assert_eq!(state.offset(512), 2 * MIB);
        assert_eq!(state.size(512), 100 * MIB);

        let ephemeral = read.partition(3).unwrap();
        assert_eq!(ephemeral.offset(512), 102 * MIB);
        assert!(ephemeral.size(512) > 8 * GIB - 104 * MIB);
        assert_eq!(read.largest_contiguous_allocatable(), 0);
    }

    #[test]
    fn disk_too_small_for_request() {
        let mut gpt = Gpt::new(64 * MIB, 512).unwrap();
        let err = gpt.allocate(128 * MIB, "STATE", fs_type()).unwrap_err();
        assert!(err.to_string().contains("too big"));
        assert!(gpt.largest_contiguous_allocatable() < 64 * MIB);
    }

    #[test]
    fn grow_after_disk_replacement() {
        let img = image(8 * GIB);
        let path = img.path().to_str().unwrap().to_string();
        {
            let dev = BlockDevice::open_exclusive(&path).unwrap();
            let mut gpt = Gpt::new(dev.size().unwrap(), 512).unwrap();
            gpt.allocate(MIB, "META", fs_type()).unwrap();
            gpt.allocate(100 * MIB, "STATE", fs_type()).unwrap();
            gpt.allocate(0, "EPHEMERAL", fs_type()).unwrap();
            gpt.write(&dev).unwrap();
        }

        img.as_file().set_len(16 * GIB).unwrap();

        let dev = BlockDevice::open_exclusive(&path).unwrap();
        let mut gpt = Gpt::read(&dev).unwrap().unwrap();
        let before = gpt.partition(3).unwrap().clone();
        let growth = gpt.available_partition_growth(3).unwrap();
        assert!(growth > 7 * GIB);

        gpt.grow_partition(3, growth).unwrap();
        gpt.write(&dev).unwrap();

        let reread = Gpt::read(&dev).unwrap().unwrap();
        let after = reread.partition(3).unwrap();
        assert_eq!(after.first_lba, before.first_lba);
        assert_eq!(after.part_guid, before.part_guid);
        assert_eq!(after.size(512), before.size(512) + growth);
        assert_eq!(reread.partition(2), gpt.partition(2));
        assert_eq!(reread.available_partition_growth(3).unwrap(), 0);
    }

    #[test]
    fn growth_is_bounded_by_the_next_partition() {
        let mut gpt = Gpt::new(GIB, 512).unwrap();
        gpt.allocate(100 * MIB, "A", fs_type()).unwrap();
        gpt.allocate(100 * MIB, "B", fs_type()).unwrap();
        assert_eq!(gpt.available_partition_growth(1).unwrap(), 0);
        assert!(gpt.grow_partition(1, MIB).is_err());
        assert!(gpt.available_partition_growth(2).unwrap() > 700 * MIB);
    }

    #[test]
    fn corrupt_primary_falls_back_to_backup() {
        let img = image(256 * MIB);
        let dev = BlockDevice::open_exclusive(img.path().to_str().unwrap()).unwrap();
        let mut gpt = Gpt::new(dev.size().unwrap(), 512).unwrap();
        gpt.allocate(10 * MIB, "SWAP", Uuid::parse_str(LINUX_SWAP).unwrap())
            .unwrap();
        gpt.write(&dev).unwrap();

        dev.write_at(512 + 40, &[0xff; 8]).unwrap();

        let read = Gpt::read(&dev).unwrap().unwrap();
        assert_eq!(read.partition(1).unwrap().name, "SWAP");
    }

    #[test]
    fn protective_mbr_is_written() {
        let img = image(64 * MIB);
        let dev = BlockDevice::open_exclusive(img.path().to_str().unwrap()).unwrap();
        Gpt::new(dev.size().unwrap(), 512).unwrap().write(&dev).unwrap();

        let mut mbr = [0u8; 512];
        dev.read_at(0, &mut mbr).unwrap();
        assert_eq!(mbr[450], 0xee);
        assert_eq!(&mbr[510..], &[0x55, 0xaa]);

        let mut header = [0u8; 8];
        dev.read_at(512, &mut header).unwrap();
        assert!(has_signature(&header));
    }
}
