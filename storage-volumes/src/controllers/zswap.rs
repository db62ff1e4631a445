// SPDX-License-Identifier: GPL-3.0-only

//! Applies the zswap configuration and publishes pool statistics.

use std::time::Duration;

use anyhow::Context;
use crossbeam_channel::{select, tick};
use storage_runtime::{Controller, ControllerContext, Input, Output};
use storage_sys::swap::Zswap;
use storage_types::{SwapStatusSpec, ZswapStatusSpec};
use tracing::info;

use crate::config::ZswapConfig;

const POLL_INTERVAL: Duration = Duration::from_secs(60);

pub struct ZswapController {
    config: Option<ZswapConfig>,
    zswap: Zswap,
    applied: bool,
}

impl ZswapController {
    pub const NAME: &'static str = "ZswapController";

    pub fn new(config: Option<ZswapConfig>) -> Self {
        Self::with_zswap(config, Zswap::default())
    }

    pub fn with_zswap(config: Option<ZswapConfig>, zswap: Zswap) -> Self {
        Self {
            config,
            zswap,
            applied: false,
        }
    }

    fn apply(&mut self) -> anyhow::Result<()> {
        let changed = match &self.config {
            Some(config) => self
                .zswap
                .configure(config.max_pool_percent, config.shrinker_enabled)
                .context("failed to configure zswap")?,
            None => self.zswap.disable().context("failed to disable zswap")?,
        };

        if changed {
            match &self.config {
                Some(config) => info!(max_pool_percent = config.max_pool_percent, "zswap enabled"),
                None => info!("zswap disabled"),
            }
        }
        self.applied = true;
        Ok(())
    }

    pub fn reconcile(&mut self, ctx: &ControllerContext) -> anyhow::Result<()> {
        if !self.applied {
            self.apply()?;
        }

        match self.zswap.status() {
            Some(status) => {
                ctx.modify(ZswapStatusSpec::ID, ZswapStatusSpec::default, |r| r.spec = status)?;
            }
            None => {
                ctx.teardown_and_destroy::<ZswapStatusSpec>(ZswapStatusSpec::ID)?;
            }
        }

        Ok(())
    }
}

impl Controller for ZswapController {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::of::<SwapStatusSpec>()]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<ZswapStatusSpec>()]
    }

    fn run(&mut self, ctx: &mut ControllerContext) -> anyhow::Result<()> {
        let ticker = tick(POLL_INTERVAL);

        // statistics are published even before the first swap shows up
        self.reconcile(ctx)?;

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

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use storage_runtime::Store;
    use storage_testing::TestContext;

    #[test]
    fn configures_and_reports() {
        let params = tempfile::tempdir().unwrap();
        let stats = tempfile::tempdir().unwrap();
        fs::write(params.path().join("enabled"), "N\n").unwrap();
        fs::write(stats.path().join("stored_pages"), "7\n").unwrap();

        let store = Store::new();
        let test = TestContext::new(&store, ZswapController::NAME);
        let mut controller = ZswapController::with_zswap(
            Some(ZswapConfig {
                max_pool_percent: 30,
                shrinker_enabled: true,
            }),
            Zswap::new(params.path(), stats.path()),
        );

        controller.reconcile(&test.ctx).unwrap();

        let percent = fs::read_to_string(params.path().join("max_pool_percent")).unwrap();
        assert_eq!(percent.trim(), "30");
        assert_eq!(fs::read_to_string(params.path().join("shrinker_enabled")).unwrap(), "Y");
        let status = store.get::<ZswapStatusSpec>(ZswapStatusSpec::ID).unwrap();
        assert_eq!(status.spec.stored_pages, 7);
    }

    #[test]
    fn no_config_disables_zswap() {
        let params = tempfile::tempdir().unwrap();
        let stats = tempfile::tempdir().unwrap();
        fs::write(params.path().join("enabled"), "Y\n").unwrap();

        let store = Store::new();
        let test = TestContext::new(&store, ZswapController::NAME);
        let mut controller = ZswapController::with_zswap(None, Zswap::new(params.path(), stats.path()));

        controller.reconcile(&test.ctx).unwrap();
        assert_eq!(fs::read_to_string(params.path().join("enabled")).unwrap(), "N");
        assert!(store.get::<ZswapStatusSpec>(ZswapStatusSpec::ID).is_none());
    }
}
