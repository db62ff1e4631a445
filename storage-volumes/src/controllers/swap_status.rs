// SPDX-License-Identifier: GPL-3.0-only

//! Mirrors the kernel's active swap areas into `SwapStatus` resources.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use crossbeam_channel::{select, tick};
use storage_runtime::{Controller, ControllerContext, Input, Output};
use storage_sys::swap::{PROC_SWAPS, parse_swaps};
use storage_types::{MountStatusSpec, SwapStatusSpec};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(60);

pub struct SwapStatusController {
    source: PathBuf,
}

impl Default for SwapStatusController {
    fn default() -> Self {
        Self::new()
    }
}

impl SwapStatusController {
    pub const NAME: &'static str = "SwapStatusController";

    pub fn new() -> Self {
        Self::with_source(PROC_SWAPS)
    }

    /// Read the swap table from `source` instead of `/proc/swaps`.
    pub fn with_source(source: impl Into<PathBuf>) -> Self {
        Self { source: source.into() }
    }

    pub fn reconcile(&mut self, ctx: &ControllerContext) -> anyhow::Result<()> {
        let table = fs::read_to_string(&self.source)
            .with_context(|| format!("failed to read {}", self.source.display()))?;
        let swaps = parse_swaps(&table).context("failed to parse swap table")?;

        let mut seen = BTreeSet::new();
        for swap in swaps {
            let device = swap.device.clone();
            ctx.modify(&device, SwapStatusSpec::default, |status| status.spec = swap)
                .with_context(|| format!("failed to write swap status {}", device))?;
            seen.insert(device);
        }

        for status in ctx.list::<SwapStatusSpec>() {
            if seen.contains(status.id()) {
                continue;
            }
            debug!("swap {} is gone", status.id());
            ctx.teardown_and_destroy::<SwapStatusSpec>(status.id())?;
        }

        Ok(())
    }
}

impl Controller for SwapStatusController {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::of::<MountStatusSpec>()]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<SwapStatusSpec>()]
    }

    fn run(&mut self, ctx: &mut ControllerContext) -> anyhow::Result<()> {
        let ticker = tick(POLL_INTERVAL);

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

            // a missing table only means the kernel has no swap support
            if let Err(err) = self.reconcile(ctx) {
                warn!("swap status: {:#}", err);
                continue;
            }
            ctx.reset_restart_backoff();
        }
    }
}
