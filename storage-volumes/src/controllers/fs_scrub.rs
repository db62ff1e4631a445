// SPDX-License-Identifier: GPL-3.0-only

//! Periodic read-only `xfs_scrub` of configured mountpoints.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use crossbeam_channel::{select, tick};
use storage_runtime::{Controller, ControllerContext, Input, Output};
use storage_sys::CommandRunner;
use storage_types::{FilesystemType, FsScrubStatusSpec, MountStatusSpec};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::FsScrubConfig;

const XFS_SCRUB: &str = "xfs_scrub";
const CHECK_INTERVAL: Duration = Duration::from_secs(60);

pub struct FsScrubController {
    runner: Arc<dyn CommandRunner>,
    configs: Vec<FsScrubConfig>,
    /// Next run per mountpoint, present while the mountpoint is mounted.
    schedule: HashMap<String, Instant>,
}

/// A random point in `(0, period]`, so that machines booted together do not
/// scrub at the same moment.
fn first_run_offset(period: Duration) -> Duration {
    let bits = Uuid::new_v4().as_u128() as u64;
    match period.as_secs() {
        0 => Duration::ZERO,
        secs => Duration::from_secs(bits % secs + 1),
    }
}

impl FsScrubController {
    pub const NAME: &'static str = "FsScrubController";

    pub fn new(runner: Arc<dyn CommandRunner>, configs: Vec<FsScrubConfig>) -> Self {
        Self {
            runner,
            configs,
            schedule: HashMap::new(),
        }
    }

    pub fn reconcile(&mut self, ctx: &ControllerContext) -> anyhow::Result<()> {
        self.reconcile_at(ctx, Instant::now())
    }

    pub fn reconcile_at(&mut self, ctx: &ControllerContext, now: Instant) -> anyhow::Result<()> {
        let mounts = ctx.list::<MountStatusSpec>();

        for config in &self.configs {
            let mountpoint = &config.mountpoint;
            let period = Duration::from_secs(config.period_secs);

            let mounted = mounts.iter().any(|mount| {
                mount.metadata.is_running()
                    && mount.spec.target == *mountpoint
                    && mount.spec.filesystem == FilesystemType::Xfs.as_str()
            });
            if !mounted {
                if self.schedule.remove(mountpoint).is_some() {
                    debug!("{} is no longer mounted, scrub unscheduled", mountpoint);
                }
                continue;
            }

            let next = *self
                .schedule
                .entry(mountpoint.clone())
                .or_insert_with(|| now + first_run_offset(period));
            if now < next {
                continue;
            }

            let started = Instant::now();
            let result = self.runner.run(XFS_SCRUB, &["-n", mountpoint.as_str()], None);
            let duration = started.elapsed();

            let status = match result {
                Ok(_) => {
                    info!("scrubbed {} in {:?}", mountpoint, duration);
                    "success".to_string()
                }
                Err(err) => {
                    warn!("scrub of {} failed: {}", mountpoint, err);
                    err.to_string()
                }
            };

            let record = FsScrubStatusSpec {
                mountpoint: mountpoint.clone(),
                period_secs: config.period_secs,
                last_run: Some(Utc::now()),
                duration_ms: duration.as_millis() as u64,
                status,
            };
            ctx.modify(mountpoint, FsScrubStatusSpec::default, |r| r.spec = record)
                .with_context(|| format!("failed to record scrub of {}", mountpoint))?;

            self.schedule.insert(mountpoint.clone(), now + period);
        }

        Ok(())
    }
}

impl Controller for FsScrubController {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::of::<MountStatusSpec>()]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<FsScrubStatusSpec>()]
    }

    fn run(&mut self, ctx: &mut ControllerContext) -> anyhow::Result<()> {
        let ticker = tick(CHECK_INTERVAL);

        loop {
            select! {
                recv(ctx.done()) -> _ => return Ok(()),
                recv(ctx.events()) -> event => {
                    if event.is_err() {
                        return Ok(());
                    }
                }
                recv(ticker) -> _ => {}
            }

            self.reconcile(ctx)?;
            ctx.reset_restart_backoff();
        }
    }
}
