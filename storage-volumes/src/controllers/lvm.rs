// SPDX-License-Identifier: GPL-3.0-only

//! Activates LVM volume groups once all of their physical volumes are seen.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::anyhow;
use storage_runtime::{Controller, ControllerContext, Input, Output};
use storage_sys::CommandRunner;
use storage_sys::lvm::{activate_vg, pvscan};
use storage_types::{DevicesStatusSpec, DiscoveredVolumeSpec};
use tracing::{debug, info, warn};

const LVM2_PV: &str = "lvm2-pv";

pub struct LvmActivationController {
    runner: Arc<dyn CommandRunner>,
    scanned: BTreeSet<String>,
    activated: BTreeSet<String>,
}

impl LvmActivationController {
    pub const NAME: &'static str = "LvmActivationController";

    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            scanned: BTreeSet::new(),
            activated: BTreeSet::new(),
        }
    }

    /// Volume groups activated so far.
    pub fn activated(&self) -> &BTreeSet<String> {
        &self.activated
    }

    pub fn reconcile(&mut self, ctx: &ControllerContext) -> anyhow::Result<()> {
        let ready = ctx
            .get::<DevicesStatusSpec>(DevicesStatusSpec::ID)
            .is_some_and(|status| status.spec.ready);
        if !ready {
            return Ok(());
        }

        let mut failed = Vec::new();

        for volume in ctx.list::<DiscoveredVolumeSpec>() {
            let dev_path = &volume.spec.dev_path;
            if volume.spec.name != LVM2_PV || self.scanned.contains(dev_path) {
                continue;
            }

            let groups = match pvscan(self.runner.as_ref(), dev_path) {
                Ok(groups) => groups,
                Err(err) => {
                    warn!("pvscan of {} failed: {}", dev_path, err);
                    failed.push(dev_path.clone());
                    continue;
                }
            };
            self.scanned.insert(dev_path.clone());

            for group in groups {
                if self.activated.contains(&group) {
                    continue;
                }
                match activate_vg(self.runner.as_ref(), &group) {
                    Ok(()) => {
                        info!("activated volume group {}", group);
                        self.activated.insert(group);
                    }
                    Err(err) => {
                        warn!("failed to activate volume group {}: {}", group, err);
                        // scan again on the next pass
                        self.scanned.remove(dev_path);
                        failed.push(group);
                    }
                }
            }
        }

        // devices that disappeared may come back with new groups
        let present: BTreeSet<String> = ctx
            .list::<DiscoveredVolumeSpec>()
            .into_iter()
            .map(|volume| volume.spec.dev_path)
            .collect();
        self.scanned.retain(|dev_path| {
            let keep = present.contains(dev_path);
            if !keep {
                debug!("physical volume {} is gone", dev_path);
            }
            keep
        });

        if failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("LVM activation failed for {}", failed.join(", ")))
        }
    }
}

impl Controller for LvmActivationController {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::of::<DiscoveredVolumeSpec>(),
            Input::id::<DevicesStatusSpec>(DevicesStatusSpec::ID),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        Vec::new()
    }

    fn run(&mut self, ctx: &mut ControllerContext) -> anyhow::Result<()> {
        while ctx.next_event() {
            self.reconcile(ctx)?;
            ctx.reset_restart_backoff();
        }

        Ok(())
    }
}
