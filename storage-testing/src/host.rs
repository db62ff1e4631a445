// SPDX-License-Identifier: GPL-3.0-only

//! An in-memory machine.
//!
//! [`FakeHost`] keeps disks, their partitions and superblocks, LUKS headers,
//! META tags and the mount table in memory, and implements every provider
//! trait the engine drives on top of them. Operations can be made to fail
//! by name with [`FakeHost::fail`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use storage_contracts::{
    Allocation, DeviceProbe, DeviceProber, DeviceScanner, DiskCheck, DiskLock, EncryptionProvider,
    FilesystemMaker, FormatOptions, MetaStore, MountBackend, MountPoint, PartitionRequest,
    PartitionTableBackend, Passphrase, ProbeResult, ProbedPartition, RejectReason, TargetSettings,
    VolumeError, VolumeResult,
};
use storage_sys::probe::partition_dev_path;
use storage_types::constants::DEV_MAPPER;
use storage_types::{EncryptionSpec, FilesystemType, MIB, VolumeType};
use tracing::debug;
use uuid::Uuid;

const GPT: &str = "gpt";
const LUKS: &str = "luks";

/// A disk and everything on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeDisk {
    pub size: u64,
    pub sector_size: u64,
    pub io_size: u64,
    pub content: ProbeResult,
    pub partitions: Vec<ProbedPartition>,
}

impl FakeDisk {
    pub fn blank(size: u64) -> Self {
        Self {
            size,
            sector_size: 512,
            io_size: 512,
            content: ProbeResult::default(),
            partitions: Vec::new(),
        }
    }

    /// Append a partition after the last one; device paths are filled in by
    /// [`FakeHost::add_disk`].
    pub fn with_partition(mut self, label: &str, size: u64, content: ProbeResult) -> Self {
        let offset = next_offset(&self);
        let number = self.partitions.len() as u32 + 1;

        self.content.name = GPT.to_string();
        self.partitions.push(ProbedPartition {
            number,
            dev_path: String::new(),
            partition_uuid: Uuid::new_v4().to_string(),
            partition_type: String::new(),
            partition_label: label.to_string(),
            offset,
            size,
            content,
        });
        self
    }

    /// Whole disk carrying a superblock, no partition table.
    pub fn with_content(mut self, content: ProbeResult) -> Self {
        self.content = content;
        self
    }
}

/// Superblock of `name` (e.g. `xfs`) with a fresh uuid.
pub fn superblock(name: &str, label: &str) -> ProbeResult {
    ProbeResult {
        name: name.to_string(),
        uuid: Uuid::new_v4().to_string(),
        label: label.to_string(),
        ..Default::default()
    }
}

fn usable_end(disk: &FakeDisk) -> u64 {
    disk.size.saturating_sub(MIB)
}

fn next_offset(disk: &FakeDisk) -> u64 {
    disk.partitions
        .iter()
        .map(|p| p.offset + p.size)
        .max()
        .unwrap_or(MIB)
}

#[derive(Debug, Default)]
struct HostState {
    disks: BTreeMap<String, FakeDisk>,

    /// LUKS key slots per device.
    luks: BTreeMap<String, BTreeMap<u32, Vec<u8>>>,
    /// Content inside each LUKS device.
    inner: BTreeMap<String, ProbeResult>,
    /// Mapped name to the device behind it.
    opened: BTreeMap<String, String>,

    tags: BTreeMap<(String, u8), Vec<u8>>,

    mounts: BTreeMap<String, MountPoint>,
    swaps: BTreeSet<String>,
    directories: BTreeSet<String>,
    symlinks: BTreeMap<String, String>,
    settings: BTreeMap<String, TargetSettings>,

    /// Disks held by a [`DiskLock`].
    locked: BTreeSet<String>,

    formatted: Vec<(String, FormatOptions)>,
    failures: BTreeMap<String, VolumeError>,
    /// Mutating operations, in order.
    log: Vec<String>,
}

impl HostState {
    fn check(&self, op: &str) -> VolumeResult<()> {
        match self.failures.get(op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn partition(&self, dev_path: &str) -> Option<(&FakeDisk, &ProbedPartition)> {
        self.disks.values().find_map(|disk| {
            disk.partitions
                .iter()
                .find(|p| p.dev_path == dev_path)
                .map(|p| (disk, p))
        })
    }

    fn mapped_device(&self, dev_path: &str) -> Option<String> {
        let name = dev_path.strip_prefix(DEV_MAPPER)?.trim_start_matches('/');
        self.opened.get(name).cloned()
    }

    fn content_mut(&mut self, dev_path: &str) -> Option<&mut ProbeResult> {
        if let Some(dev) = self.mapped_device(dev_path) {
            return Some(self.inner.entry(dev).or_default());
        }
        if self.disks.contains_key(dev_path) {
            return self.disks.get_mut(dev_path).map(|disk| &mut disk.content);
        }

        self.disks.values_mut().find_map(|disk| {
            disk.partitions
                .iter_mut()
                .find(|p| p.dev_path == dev_path)
                .map(|p| &mut p.content)
        })
    }

    fn scan(&self, dev_path: &str) -> VolumeResult<DeviceProbe> {
        if self.locked.contains(dev_path) {
            return Err(VolumeError::retryable(format!("timed out locking {}", dev_path)));
        }

        if let Some(disk) = self.disks.get(dev_path) {
            return Ok(DeviceProbe {
                size: disk.size,
                sector_size: disk.sector_size,
                io_size: disk.io_size,
                content: disk.content.clone(),
                partitions: disk.partitions.clone(),
            });
        }

        if let Some((disk, partition)) = self.partition(dev_path) {
            return Ok(DeviceProbe {
                size: partition.size,
                sector_size: disk.sector_size,
                io_size: disk.io_size,
                content: partition.content.clone(),
                partitions: Vec::new(),
            });
        }

        if let Some(dev) = self.mapped_device(dev_path) {
            let mut probe = self.scan(&dev)?;
            probe.content = self.inner.get(&dev).cloned().unwrap_or_default();
            return Ok(probe);
        }

        Err(VolumeError::system(format!("{} does not exist", dev_path)))
    }

    fn slots(&self, dev_path: &str) -> VolumeResult<&BTreeMap<u32, Vec<u8>>> {
        self.luks
            .get(dev_path)
            .ok_or_else(|| VolumeError::system(format!("{} is not a LUKS device", dev_path)))
    }

    fn unlocks(&self, dev_path: &str, key: &Passphrase) -> VolumeResult<bool> {
        Ok(self
            .slots(dev_path)?
            .values()
            .any(|stored| stored.as_slice() == key.as_bytes()))
    }
}

#[derive(Debug, Default)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

/// Unlocks the disk when dropped.
struct FakeDiskGuard {
    state: Arc<Mutex<HostState>>,
    disk: String,
}

impl Drop for FakeDiskGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.locked.remove(&self.disk);
        state.log.push(format!("unlock {}", self.disk));
    }
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_disk(&self, dev_path: &str, mut disk: FakeDisk) {
        for partition in &mut disk.partitions {
            partition.dev_path = partition_dev_path(dev_path, partition.number);
        }
        self.state.lock().disks.insert(dev_path.to_string(), disk);
    }

    pub fn remove_disk(&self, dev_path: &str) -> Option<FakeDisk> {
        self.state.lock().disks.remove(dev_path)
    }

    pub fn disk(&self, dev_path: &str) -> Option<FakeDisk> {
        self.state.lock().disks.get(dev_path).cloned()
    }

    pub fn partition(&self, dev_path: &str) -> Option<ProbedPartition> {
        self.state
            .lock()
            .partition(dev_path)
            .map(|(_, partition)| partition.clone())
    }

    /// Superblock visible at `dev_path`, looking through opened mappings.
    pub fn content(&self, dev_path: &str) -> Option<ProbeResult> {
        self.state.lock().scan(dev_path).ok().map(|probe| probe.content)
    }

    pub fn set_content(&self, dev_path: &str, content: ProbeResult) -> bool {
        match self.state.lock().content_mut(dev_path) {
            Some(slot) => {
                *slot = content;
                true
            }
            None => false,
        }
    }

    /// Make operation `op` fail with `err` until [`FakeHost::heal`].
    ///
    /// Operations: `scan`, `probe`, `check_disk`, `allocate`, `grow`,
    /// `format`, `grow_fs`, `encrypt`, `open`, `close`, `add_key`,
    /// `remove_key`, `meta`, `mount`, `unmount`, `swap`.
    pub fn fail(&self, op: &str, err: VolumeError) {
        self.state.lock().failures.insert(op.to_string(), err);
    }

    pub fn heal(&self, op: &str) {
        self.state.lock().failures.remove(op);
    }

    pub fn mounts(&self) -> Vec<MountPoint> {
        self.state.lock().mounts.values().cloned().collect()
    }

    pub fn mount_at(&self, target: &str) -> Option<MountPoint> {
        self.state.lock().mounts.get(target).cloned()
    }

    pub fn swaps(&self) -> Vec<String> {
        self.state.lock().swaps.iter().cloned().collect()
    }

    pub fn directories(&self) -> Vec<String> {
        self.state.lock().directories.iter().cloned().collect()
    }

    pub fn symlink(&self, link: &str) -> Option<String> {
        self.state.lock().symlinks.get(link).cloned()
    }

    pub fn settings(&self, path: &str) -> Option<TargetSettings> {
        self.state.lock().settings.get(path).cloned()
    }

    pub fn tag(&self, dev_path: &str, tag: u8) -> Option<Vec<u8>> {
        self.state
            .lock()
            .tags
            .get(&(dev_path.to_string(), tag))
            .cloned()
    }

    pub fn put_tag(&self, dev_path: &str, tag: u8, value: &[u8]) {
        self.state
            .lock()
            .tags
            .insert((dev_path.to_string(), tag), value.to_vec());
    }

    pub fn formatted(&self) -> Vec<(String, FormatOptions)> {
        self.state.lock().formatted.clone()
    }

    /// Mapped names currently open, with their devices.
    pub fn opened(&self) -> BTreeMap<String, String> {
        self.state.lock().opened.clone()
    }

    pub fn keyslots(&self, dev_path: &str) -> Vec<u32> {
        self.state
            .lock()
            .luks
            .get(dev_path)
            .map(|slots| slots.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Mutating operations in the order they happened, e.g. `mount /var`.
    /// Whether a [`DiskLock`] on `dev_path` is alive.
    pub fn is_locked(&self, dev_path: &str) -> bool {
        self.state.lock().locked.contains(dev_path)
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }
}

impl DeviceScanner for FakeHost {
    fn scan(&self, dev_path: &str) -> VolumeResult<DeviceProbe> {
        if self.is_locked(dev_path) {
            return Err(VolumeError::retryable(format!("timed out locking {}", dev_path)));
        }

        let state = self.state.lock();
        state.check("scan")?;
        state.scan(dev_path)
    }
}

impl DeviceProber for FakeHost {
    fn probe(&self, dev_path: &str) -> VolumeResult<ProbeResult> {
        let state = self.state.lock();
        state.check("probe")?;
        Ok(state.scan(dev_path)?.content)
    }
}

impl PartitionTableBackend for FakeHost {
    fn lock_disk(&self, disk_path: &str) -> VolumeResult<DiskLock> {
        let mut state = self.state.lock();
        state.check("lock_disk")?;

        if !state.disks.contains_key(disk_path) {
            return Err(VolumeError::system(format!("{} does not exist", disk_path)));
        }
        if !state.locked.insert(disk_path.to_string()) {
            return Err(VolumeError::retryable(format!("timed out locking {}", disk_path)));
        }
        state.log.push(format!("lock {}", disk_path));

        Ok(DiskLock::new(FakeDiskGuard {
            state: self.state.clone(),
            disk: disk_path.to_string(),
        }))
    }

    fn check_disk(
        &self,
        disk_path: &str,
        volume_type: VolumeType,
        min_size: u64,
    ) -> VolumeResult<DiskCheck> {
        let state = self.state.lock();
        state.check("check_disk")?;

        let disk = state
            .disks
            .get(disk_path)
            .ok_or_else(|| VolumeError::system(format!("{} does not exist", disk_path)))?;

        if volume_type == VolumeType::Disk {
            if disk.content.is_empty() && disk.partitions.is_empty() {
                return Ok(DiskCheck::Fits);
            }
            return Ok(DiskCheck::Rejected(RejectReason::WrongFormat));
        }

        if !disk.content.is_empty() && disk.content.name != GPT {
            return Ok(DiskCheck::Rejected(RejectReason::WrongFormat));
        }

        if usable_end(disk).saturating_sub(next_offset(disk)) < min_size {
            return Ok(DiskCheck::Rejected(RejectReason::NotEnoughSpace));
        }

        Ok(DiskCheck::Fits)
    }

    fn allocate(&self, disk_path: &str, request: &PartitionRequest) -> VolumeResult<Allocation> {
        let mut state = self.state.lock();
        state.check("allocate")?;

        let disk = state
            .disks
            .get_mut(disk_path)
            .ok_or_else(|| VolumeError::system(format!("{} does not exist", disk_path)))?;

        if disk.content.is_empty() {
            disk.content = superblock(GPT, "");
        }

        let offset = next_offset(disk);
        let available = usable_end(disk).saturating_sub(offset);
        let size = match request.max_size {
            0 => available,
            max => max.min(available),
        };
        if size < request.min_size || size == 0 {
            return Err(VolumeError::retryable(format!(
                "not enough space on {}: {} < {}",
                disk_path, size, request.min_size
            )));
        }

        let number = disk.partitions.iter().map(|p| p.number).max().unwrap_or(0) + 1;
        let partition = ProbedPartition {
            number,
            dev_path: partition_dev_path(disk_path, number),
            partition_uuid: Uuid::new_v4().to_string(),
            partition_type: request.type_uuid.clone(),
            partition_label: request.label.clone(),
            offset,
            size,
            content: ProbeResult::default(),
        };
        disk.partitions.push(partition.clone());

        debug!("allocated {} ({} bytes)", partition.dev_path, size);
        state.log.push(format!("allocate {}", partition.dev_path));

        Ok(Allocation {
            partition_index: number,
            dev_path: partition.dev_path,
            partition_uuid: partition.partition_uuid,
            size,
        })
    }

    fn grow(
        &self,
        disk_path: &str,
        partition_index: u32,
        max_size: u64,
    ) -> VolumeResult<Option<u64>> {
        let mut state = self.state.lock();
        state.check("grow")?;

        let disk = state
            .disks
            .get_mut(disk_path)
            .ok_or_else(|| VolumeError::system(format!("{} does not exist", disk_path)))?;
        let end = usable_end(disk);

        let Some(position) = disk.partitions.iter().position(|p| p.number == partition_index) else {
            return Err(VolumeError::system(format!(
                "partition {} not found on {}",
                partition_index, disk_path
            )));
        };
        let offset = disk.partitions[position].offset;

        let next = disk
            .partitions
            .iter()
            .map(|p| p.offset)
            .filter(|start| *start > offset)
            .min()
            .unwrap_or(end);

        let room = next - offset;
        let target = match max_size {
            0 => room,
            max => max.min(room),
        };

        let partition = &mut disk.partitions[position];
        if target <= partition.size {
            return Ok(None);
        }

        partition.size = target;
        let dev_path = partition.dev_path.clone();
        state.log.push(format!("grow {}", dev_path));
        Ok(Some(target))
    }
}

impl FilesystemMaker for FakeHost {
    fn format(&self, dev_path: &str, options: &FormatOptions) -> VolumeResult<()> {
        let mut state = self.state.lock();
        state.check("format")?;

        let content = state
            .content_mut(dev_path)
            .ok_or_else(|| VolumeError::system(format!("{} does not exist", dev_path)))?;
        *content = superblock(options.filesystem.as_str(), &options.label);

        state.formatted.push((dev_path.to_string(), options.clone()));
        state.log.push(format!("format {} {}", dev_path, options.filesystem));
        Ok(())
    }

    fn grow(&self, dev_path: &str, filesystem: FilesystemType) -> VolumeResult<()> {
        let mut state = self.state.lock();
        state.check("grow_fs")?;
        state.log.push(format!("grow_fs {} {}", dev_path, filesystem));
        Ok(())
    }
}

impl EncryptionProvider for FakeHost {
    fn format(
        &self,
        dev_path: &str,
        _spec: &EncryptionSpec,
        slot: u32,
        key: &Passphrase,
    ) -> VolumeResult<()> {
        let mut state = self.state.lock();
        state.check("encrypt")?;

        let content = state
            .content_mut(dev_path)
            .ok_or_else(|| VolumeError::system(format!("{} does not exist", dev_path)))?;
        *content = superblock(LUKS, "");

        state
            .luks
            .insert(dev_path.to_string(), BTreeMap::from([(slot, key.as_bytes().to_vec())]));
        state.inner.remove(dev_path);
        state.log.push(format!("encrypt {}", dev_path));
        Ok(())
    }

    fn open(
        &self,
        dev_path: &str,
        mapped_name: &str,
        _spec: &EncryptionSpec,
        key: &Passphrase,
    ) -> VolumeResult<String> {
        let mut state = self.state.lock();
        state.check("open")?;

        if !state.unlocks(dev_path, key)? {
            return Err(VolumeError::system(format!(
                "no key available with this passphrase for {}",
                dev_path
            )));
        }

        let mapped_path = format!("{}/{}", DEV_MAPPER, mapped_name);
        if state.opened.get(mapped_name).map(String::as_str) == Some(dev_path) {
            return Ok(mapped_path);
        }

        state.opened.insert(mapped_name.to_string(), dev_path.to_string());
        state.log.push(format!("open {}", mapped_name));
        Ok(mapped_path)
    }

    fn close(&self, mapped_name: &str) -> VolumeResult<()> {
        let mut state = self.state.lock();
        state.check("close")?;

        if state.opened.remove(mapped_name).is_some() {
            state.log.push(format!("close {}", mapped_name));
        }
        Ok(())
    }

    fn add_key(
        &self,
        dev_path: &str,
        existing: &Passphrase,
        slot: u32,
        key: &Passphrase,
    ) -> VolumeResult<()> {
        let mut state = self.state.lock();
        state.check("add_key")?;

        if !state.unlocks(dev_path, existing)? {
            return Err(VolumeError::system("existing passphrase does not unlock the device"));
        }

        let slots = state
            .luks
            .get_mut(dev_path)
            .ok_or_else(|| VolumeError::system(format!("{} is not a LUKS device", dev_path)))?;
        if slots.contains_key(&slot) {
            return Err(VolumeError::system(format!("key slot {} is in use", slot)));
        }
        slots.insert(slot, key.as_bytes().to_vec());
        Ok(())
    }

    fn remove_key(&self, dev_path: &str, slot: u32, existing: &Passphrase) -> VolumeResult<()> {
        let mut state = self.state.lock();
        state.check("remove_key")?;

        if !state.unlocks(dev_path, existing)? {
            return Err(VolumeError::system("existing passphrase does not unlock the device"));
        }

        if let Some(slots) = state.luks.get_mut(dev_path) {
            slots.remove(&slot);
        }
        Ok(())
    }

    fn check_key(&self, dev_path: &str, slot: u32, key: &Passphrase) -> VolumeResult<bool> {
        let state = self.state.lock();
        Ok(state
            .slots(dev_path)?
            .get(&slot)
            .is_some_and(|stored| stored.as_slice() == key.as_bytes()))
    }

    fn read_keyslots(&self, dev_path: &str) -> VolumeResult<Vec<u32>> {
        let state = self.state.lock();
        Ok(state.slots(dev_path)?.keys().copied().collect())
    }
}

impl MetaStore for FakeHost {
    fn read_tag(&self, dev_path: &str, tag: u8) -> VolumeResult<Option<Vec<u8>>> {
        let state = self.state.lock();
        state.check("meta")?;
        Ok(state.tags.get(&(dev_path.to_string(), tag)).cloned())
    }

    fn set_tag(&self, dev_path: &str, tag: u8, value: &[u8]) -> VolumeResult<bool> {
        let mut state = self.state.lock();
        state.check("meta")?;

        let key = (dev_path.to_string(), tag);
        if state.tags.get(&key).map(Vec::as_slice) == Some(value) {
            return Ok(false);
        }

        state.tags.insert(key, value.to_vec());
        state.log.push(format!("set_tag {} {:#04x}", dev_path, tag));
        Ok(true)
    }
}

impl MountBackend for FakeHost {
    fn mount(&self, point: &MountPoint) -> VolumeResult<()> {
        let mut state = self.state.lock();
        state.check("mount")?;

        if state.mounts.contains_key(&point.target) {
            return Err(VolumeError::system(format!("{} is already mounted", point.target)));
        }

        state.mounts.insert(point.target.clone(), point.clone());
        state.log.push(format!("mount {}", point.target));
        Ok(())
    }

    fn unmount(&self, target: &str) -> VolumeResult<()> {
        let mut state = self.state.lock();
        state.check("unmount")?;

        if state.mounts.remove(target).is_some() {
            state.log.push(format!("unmount {}", target));
        }
        Ok(())
    }

    fn remount(&self, target: &str, read_only: bool) -> VolumeResult<()> {
        let mut state = self.state.lock();
        state.check("mount")?;

        let point = state
            .mounts
            .get_mut(target)
            .ok_or_else(|| VolumeError::system(format!("{} is not mounted", target)))?;
        point.read_only = read_only;
        state.log.push(format!("remount {} ro={}", target, read_only));
        Ok(())
    }

    fn ensure_directory(&self, path: &str) -> VolumeResult<()> {
        self.state.lock().directories.insert(path.to_string());
        Ok(())
    }

    fn ensure_symlink(&self, target: &str, link: &str, force: bool) -> VolumeResult<()> {
        let mut state = self.state.lock();

        match state.symlinks.get(link) {
            Some(existing) if existing == target => return Ok(()),
            Some(_) if !force => {
                return Err(VolumeError::system(format!("{} already exists", link)));
            }
            _ => {}
        }

        state.symlinks.insert(link.to_string(), target.to_string());
        state.log.push(format!("symlink {} -> {}", link, target));
        Ok(())
    }

    fn apply_settings(&self, path: &str, settings: &TargetSettings) -> VolumeResult<()> {
        self.state
            .lock()
            .settings
            .insert(path.to_string(), settings.clone());
        Ok(())
    }

    fn swap_on(&self, dev_path: &str) -> VolumeResult<()> {
        let mut state = self.state.lock();
        state.check("swap")?;

        if state.swaps.insert(dev_path.to_string()) {
            state.log.push(format!("swapon {}", dev_path));
        }
        Ok(())
    }

    fn swap_off(&self, dev_path: &str) -> VolumeResult<()> {
        let mut state = self.state.lock();
        state.check("swap")?;

        if state.swaps.remove(dev_path) {
            state.log.push(format!("swapoff {}", dev_path));
        }
        Ok(())
    }
}
