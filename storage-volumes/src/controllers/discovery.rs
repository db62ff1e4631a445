// SPDX-License-Identifier: GPL-3.0-only

//! Probes block devices into `DiscoveredVolume` resources.
//!
//! Devices whose generation changed are queued and probed in batches on a
//! short ticker. A partition is always probed through its disk so that the
//! partition table fields stay consistent.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use crossbeam_channel::{select, tick};
use storage_contracts::{DeviceProbe, ProbeResult, ProbedPartition};
use storage_runtime::{Controller, ControllerContext, Input, Output};
use storage_types::{
    DeviceSpec, DiscoveredVolumeSpec, DiscoveryRefreshRequestSpec, DiscoveryRefreshStatusSpec,
};
use tracing::{debug, warn};

use crate::backends::Backends;

const BATCH_INTERVAL: Duration = Duration::from_millis(100);
const RAM_MAJOR: u32 = 1;

pub struct DiscoveryController {
    backends: Backends,
    dev_root: String,
    /// Device generation last probed.
    observed: HashMap<String, u64>,
    queue: BTreeSet<String>,
    last_request: i64,
}

impl DiscoveryController {
    pub const NAME: &'static str = "DiscoveryController";

    pub fn new(backends: Backends, dev_root: impl Into<String>) -> Self {
        Self {
            backends,
            dev_root: dev_root.into(),
            observed: HashMap::new(),
            queue: BTreeSet::new(),
            last_request: 0,
        }
    }

    /// Queue devices that appeared, changed or vanished since the last look.
    pub fn process_events(&mut self, ctx: &ControllerContext) -> anyhow::Result<()> {
        let devices = ctx.list::<DeviceSpec>();
        let mut present = BTreeSet::new();

        let refresh = ctx
            .get::<DiscoveryRefreshRequestSpec>(DiscoveryRefreshRequestSpec::ID)
            .map(|request| request.spec.request)
            .unwrap_or_default();
        let full = refresh != self.last_request;
        if full {
            debug!("discovery refresh {} requested", refresh);
            self.last_request = refresh;
        }

        for device in &devices {
            if device.spec.major == RAM_MAJOR {
                continue;
            }
            present.insert(device.id().to_string());

            let changed = self.observed.get(device.id()) != Some(&device.spec.generation);
            if changed || full {
                self.observed
                    .insert(device.id().to_string(), device.spec.generation);
                self.queue.insert(device.id().to_string());
            }
        }

        let gone: Vec<String> = self
            .observed
            .keys()
            .filter(|id| !present.contains(*id))
            .cloned()
            .collect();
        for id in gone {
            self.observed.remove(&id);
            self.queue.insert(id);
        }

        if self.queue.is_empty() {
            self.write_refresh_status(ctx)?;
        }

        Ok(())
    }

    /// Probe everything queued.
    pub fn rescan(&mut self, ctx: &ControllerContext) -> anyhow::Result<()> {
        let ids = std::mem::take(&mut self.queue);
        if ids.is_empty() {
            return Ok(());
        }

        let mut touched = BTreeSet::new();
        let mut failed = BTreeSet::new();
        let mut requeue = BTreeSet::new();

        let mut scan_ids = BTreeSet::new();
        for id in &ids {
            match ctx.get::<DeviceSpec>(id) {
                Some(device) if device.spec.is_partition() && !device.spec.parent.is_empty() => {
                    scan_ids.insert(device.spec.parent.clone());
                }
                Some(_) => {
                    scan_ids.insert(id.clone());
                }
                None => {
                    failed.insert(id.clone());
                }
            }
        }

        for id in scan_ids {
            let Some(device) = ctx.get::<DeviceSpec>(&id) else {
                failed.insert(id);
                continue;
            };

            let dev_path = format!("{}/{}", self.dev_root, id);
            let probe = match self.backends.scanner.scan(&dev_path) {
                Ok(probe) => probe,
                Err(err) if err.is_retryable() => {
                    debug!("{} is busy, probing it again later: {}", dev_path, err);
                    requeue.insert(id);
                    continue;
                }
                Err(err) => {
                    debug!("failed to probe {}: {}", dev_path, err);
                    failed.insert(id);
                    continue;
                }
            };

            touched.insert(id.clone());
            ctx.modify(&id, DiscoveredVolumeSpec::default, |volume| {
                volume.spec = device_volume(&device.spec, &dev_path, &probe);
            })
            .with_context(|| format!("failed to write discovered volume {}", id))?;

            for partition in &probe.partitions {
                let part_id = Path::new(&partition.dev_path)
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or_default();
                if part_id.is_empty() {
                    continue;
                }

                touched.insert(part_id.clone());
                ctx.modify(&part_id, DiscoveredVolumeSpec::default, |volume| {
                    volume.spec = partition_volume(&id, &dev_path, &probe, partition);
                })
                .with_context(|| format!("failed to write discovered volume {}", part_id))?;
            }
        }

        for volume in ctx.list::<DiscoveredVolumeSpec>() {
            if touched.contains(volume.id()) {
                continue;
            }

            let parent = &volume.spec.parent;
            let parent_changed =
                !parent.is_empty() && (touched.contains(parent) || failed.contains(parent));
            if failed.contains(volume.id()) || parent_changed {
                match ctx.destroy::<DiscoveredVolumeSpec>(volume.id()) {
                    Ok(()) => debug!("discovered volume {} gone", volume.id()),
                    Err(err) if err.is_not_found() => {}
                    Err(err) => {
                        return Err(err)
                            .with_context(|| format!("failed to remove discovered volume {}", volume.id()));
                    }
                }
            }
        }

        if !requeue.is_empty() {
            warn!("devices {:?} were locked, probing them again", requeue);
        }
        self.queue.extend(requeue);

        if self.queue.is_empty() {
            self.write_refresh_status(ctx)?;
        }

        Ok(())
    }

    fn write_refresh_status(&self, ctx: &ControllerContext) -> anyhow::Result<()> {
        let request = self.last_request;
        ctx.modify(
            DiscoveryRefreshStatusSpec::ID,
            DiscoveryRefreshStatusSpec::default,
            |status| status.spec.request = request,
        )?;
        Ok(())
    }
}

fn device_volume(device: &DeviceSpec, dev_path: &str, probe: &DeviceProbe) -> DiscoveredVolumeSpec {
    let content = &probe.content;

    DiscoveredVolumeSpec {
        dev_path: dev_path.to_string(),
        device_type: device.device_type.clone(),
        size: probe.size,
        sector_size: probe.sector_size,
        io_size: probe.io_size,
        ..with_content(content)
    }
}

fn partition_volume(
    disk_id: &str,
    disk_path: &str,
    disk: &DeviceProbe,
    partition: &ProbedPartition,
) -> DiscoveredVolumeSpec {
    let content = &partition.content;
    let size = match content.probed_size {
        0 => partition.size,
        probed => probed,
    };

    DiscoveredVolumeSpec {
        dev_path: partition.dev_path.clone(),
        parent: disk_id.to_string(),
        parent_dev_path: disk_path.to_string(),
        device_type: "partition".to_string(),
        size,
        sector_size: disk.sector_size,
        io_size: disk.io_size,
        partition_uuid: partition.partition_uuid.clone(),
        partition_type: partition.partition_type.clone(),
        partition_label: partition.partition_label.clone(),
        partition_index: partition.number,
        offset: partition.offset,
        ..with_content(content)
    }
}

fn with_content(content: &ProbeResult) -> DiscoveredVolumeSpec {
    DiscoveredVolumeSpec {
        name: content.name.clone(),
        uuid: content.uuid.clone(),
        label: content.label.clone(),
        block_size: content.block_size,
        filesystem_block_size: content.block_size,
        probed_size: content.probed_size,
        ..Default::default()
    }
}

impl Controller for DiscoveryController {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::of::<DeviceSpec>(),
            Input::id::<DiscoveryRefreshRequestSpec>(DiscoveryRefreshRequestSpec::ID),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![
            Output::exclusive::<DiscoveredVolumeSpec>(),
            Output::exclusive::<DiscoveryRefreshStatusSpec>(),
        ]
    }

    fn run(&mut self, ctx: &mut ControllerContext) -> anyhow::Result<()> {
        let ticker = tick(BATCH_INTERVAL);

        loop {
            select! {
                recv(ctx.done()) -> _ => return Ok(()),
                recv(ctx.events()) -> event => {
                    if event.is_err() {
                        return Ok(());
                    }
                    self.process_events(ctx)?;
                }
                recv(ticker) -> _ => self.rescan(ctx)?,
            }

            ctx.reset_restart_backoff();
        }
    }
}
