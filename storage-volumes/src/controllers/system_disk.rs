// SPDX-License-Identifier: GPL-3.0-only

//! Finds the disk carrying META.

use storage_expr::Activation;
use storage_runtime::{Controller, ControllerContext, Input, Output};
use storage_types::{DiscoveredVolumeSpec, DiskSpec, SystemDiskSpec};
use tracing::{info, warn};

use crate::transform::meta_locator;

#[derive(Default)]
pub struct SystemDiskController;

impl SystemDiskController {
    pub const NAME: &'static str = "SystemDiskController";

    pub fn new() -> Self {
        Self
    }

    pub fn reconcile(&mut self, ctx: &ControllerContext) -> anyhow::Result<()> {
        let locator = meta_locator();
        let disks = ctx.list::<DiskSpec>();
        let mut found = None;

        for volume in ctx.list::<DiscoveredVolumeSpec>() {
            if volume.spec.parent.is_empty() {
                continue;
            }

            let disk = disks
                .iter()
                .find(|disk| disk.spec.dev_path == volume.spec.parent_dev_path)
                .map(|disk| disk.spec.expr_value())
                .unwrap_or_else(|| DiskSpec::default().expr_value());
            let activation = Activation::new()
                .with("volume", volume.spec.expr_value())
                .with("disk", disk)
                .with("system_disk", false);

            match locator.eval_bool(&activation) {
                Ok(true) => {
                    found = Some(SystemDiskSpec {
                        disk_id: volume.spec.parent.clone(),
                        dev_path: volume.spec.parent_dev_path.clone(),
                    });
                    break;
                }
                Ok(false) => {}
                Err(err) => warn!("failed to evaluate META locator on {}: {}", volume.id(), err),
            }
        }

        match found {
            Some(system_disk) => {
                let previous = ctx.get::<SystemDiskSpec>(SystemDiskSpec::ID);
                if previous.as_ref().map(|p| &p.spec) != Some(&system_disk) {
                    info!("system disk is {}", system_disk.dev_path);
                }
                ctx.modify(SystemDiskSpec::ID, SystemDiskSpec::default, |resource| {
                    resource.spec = system_disk
                })?;
            }
            None => match ctx.destroy::<SystemDiskSpec>(SystemDiskSpec::ID) {
                Ok(()) => info!("system disk is gone"),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            },
        }

        Ok(())
    }
}

impl Controller for SystemDiskController {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::of::<DiscoveredVolumeSpec>(), Input::of::<DiskSpec>()]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<SystemDiskSpec>()]
    }

    fn run(&mut self, ctx: &mut ControllerContext) -> anyhow::Result<()> {
        while ctx.next_event() {
            self.reconcile(ctx)?;
            ctx.reset_restart_backoff();
        }

        Ok(())
    }
}
