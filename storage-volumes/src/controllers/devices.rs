// SPDX-License-Identifier: GPL-3.0-only

//! Kernel block devices, mirrored as `Device` resources.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Context;
use crossbeam_channel::{Receiver, never, select};
use storage_runtime::{Controller, ControllerContext, Input, Output};
use storage_sys::inotify::DevWatcher;
use storage_sys::sysfs::Sysfs;
use storage_sys::uevent::{Action, Uevent, UeventSocket};
use storage_types::{DeviceResyncSpec, DeviceSpec};
use tracing::{debug, warn};

pub struct DevicesController {
    sysfs: Sysfs,
    dev_root: String,
    /// Listen to netlink and inotify; off when only the initial walk is wanted.
    watch_kernel: bool,
    watcher: Option<DevWatcher>,
}

impl DevicesController {
    pub const NAME: &'static str = "DevicesController";

    pub fn new(sysfs: Sysfs, dev_root: impl Into<String>, watch_kernel: bool) -> Self {
        Self {
            sysfs,
            dev_root: dev_root.into(),
            watch_kernel,
            watcher: None,
        }
    }

    /// Walk `/sys/class/block`, then drop devices the walk did not see.
    pub fn resync(&mut self, ctx: &ControllerContext) -> anyhow::Result<()> {
        let events = self.sysfs.walk_block().context("failed to walk block devices")?;
        let mut seen = BTreeSet::new();

        for event in &events {
            self.process_event(ctx, event)?;
            seen.insert(event.dev_name().to_string());
        }

        for device in ctx.list::<DeviceSpec>() {
            if seen.contains(device.id()) {
                continue;
            }
            match ctx.destroy::<DeviceSpec>(device.id()) {
                Ok(()) => debug!("device {} vanished", device.id()),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err).context(format!("failed to remove device {}", device.id())),
            }
        }

        ctx.modify(DeviceResyncSpec::ID, DeviceResyncSpec::default, |r| r.spec.done = true)?;
        Ok(())
    }

    pub fn process_event(&mut self, ctx: &ControllerContext, event: &Uevent) -> anyhow::Result<()> {
        if !event.is_block() {
            return Ok(());
        }

        let id = event.dev_name();
        if id.is_empty() {
            return Ok(());
        }

        let dir = self.sysfs.device_dir(&event.dev_path);
        let present = dir.exists();
        debug!("device event {} {} (present {})", event.action, id, present);

        match event.action {
            Action::Remove => {
                if present {
                    // a stale remove for a node that came back
                    return Ok(());
                }

                match ctx.destroy::<DeviceSpec>(id) {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => {}
                    Err(err) => return Err(err).context(format!("failed to remove device {}", id)),
                }

                if let Some(watcher) = &self.watcher
                    && let Err(err) = watcher.unwatch(id)
                {
                    debug!("failed to unwatch {}: {}", id, err);
                }
            }
            _ => {
                if !present {
                    return Ok(());
                }

                let secondaries = if event.dev_type() == "partition" {
                    Vec::new()
                } else {
                    self.sysfs.secondaries(&dir)
                };
                let parent = if event.dev_type() == "partition" {
                    parent_name(&dir)
                } else {
                    String::new()
                };
                let dev_path = dir.display().to_string();

                ctx.modify(id, DeviceSpec::default, |device| {
                    let spec = &mut device.spec;
                    spec.device_type = event.dev_type().to_string();
                    spec.major = event.major();
                    spec.minor = event.minor();
                    spec.dev_path = dev_path;
                    spec.dev_name = id.to_string();
                    spec.partition_name = event.partition_name().to_string();
                    spec.partition_number = event.partition_number();
                    spec.parent = parent;
                    spec.secondaries = secondaries;
                    spec.generation += 1;
                })
                .with_context(|| format!("failed to modify device {}", id))?;

                if let Some(watcher) = &self.watcher {
                    watcher
                        .watch(id)
                        .with_context(|| format!("failed to watch {}/{}", self.dev_root, id))?;
                }
            }
        }

        Ok(())
    }

    /// A process closed `/dev/<id>` after writing: its contents may have changed.
    pub fn bump_generation(&self, ctx: &ControllerContext, id: &str) -> anyhow::Result<()> {
        if ctx.get::<DeviceSpec>(id).is_none() {
            return Ok(());
        }

        debug!("device {} written, bumping generation", id);
        ctx.modify(id, DeviceSpec::default, |device| device.spec.generation += 1)?;
        Ok(())
    }
}

fn parent_name(dir: &Path) -> String {
    dir.parent()
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

impl Controller for DevicesController {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn inputs(&self) -> Vec<Input> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<Output> {
        vec![
            Output::exclusive::<DeviceSpec>(),
            Output::exclusive::<DeviceResyncSpec>(),
        ]
    }

    fn run(&mut self, ctx: &mut ControllerContext) -> anyhow::Result<()> {
        // subscribe before the walk so nothing slips in between
        let (uevents, written): (Receiver<Uevent>, Receiver<String>) = if self.watch_kernel {
            let socket = UeventSocket::open().context("failed to open uevent socket")?;
            let uevents = socket.spawn_reader(ctx.done().clone())?;

            let watcher = DevWatcher::with_root(&self.dev_root).context("failed to set up inotify")?;
            let written = watcher.spawn_reader(ctx.done().clone())?;
            self.watcher = Some(watcher);

            (uevents, written)
        } else {
            (never(), never())
        };

        self.resync(ctx)?;
        ctx.reset_restart_backoff();

        loop {
            select! {
                recv(ctx.done()) -> _ => return Ok(()),
                recv(uevents) -> event => match event {
                    Ok(event) => self.process_event(ctx, &event)?,
                    Err(_) => {
                        if ctx.is_cancelled() {
                            return Ok(());
                        }
                        anyhow::bail!("uevent reader stopped");
                    }
                },
                recv(written) -> name => match name {
                    Ok(name) => self.bump_generation(ctx, &name)?,
                    Err(_) => {
                        if ctx.is_cancelled() {
                            return Ok(());
                        }
                        warn!("inotify reader stopped");
                        anyhow::bail!("inotify reader stopped");
                    }
                },
            }
        }
    }
}
