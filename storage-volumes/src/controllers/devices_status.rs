// SPDX-License-Identifier: GPL-3.0-only

//! Decides when the initial device burst has settled.

use std::time::{Duration, Instant};

use crossbeam_channel::{select, tick};
use storage_runtime::{Controller, ControllerContext, Input, Output};
use storage_types::{DeviceResyncSpec, DeviceSpec, DevicesStatusSpec};
use tracing::info;

/// Quiet period after the last device change.
const SETTLE_QUIET: Duration = Duration::from_millis(500);
const TICK: Duration = Duration::from_millis(100);

pub struct DevicesStatusController {
    settle_timeout: Duration,
    started: Option<Instant>,
    last_change: Option<Instant>,
    /// `(id, generation)` of every device at the last look.
    seen: Vec<(String, u64)>,
}

impl DevicesStatusController {
    pub const NAME: &'static str = "DevicesStatusController";

    pub fn new(settle_timeout: Duration) -> Self {
        Self {
            settle_timeout,
            started: None,
            last_change: None,
            seen: Vec::new(),
        }
    }

    pub fn reconcile(&mut self, ctx: &ControllerContext, now: Instant) -> anyhow::Result<()> {
        let started = *self.started.get_or_insert(now);

        let current = ctx.get::<DevicesStatusSpec>(DevicesStatusSpec::ID);
        if current.as_ref().is_some_and(|status| status.spec.ready) {
            return Ok(());
        }
        if current.is_none() {
            ctx.modify(DevicesStatusSpec::ID, DevicesStatusSpec::default, |_| {})?;
        }

        let devices: Vec<(String, u64)> = ctx
            .list::<DeviceSpec>()
            .into_iter()
            .map(|device| (device.id().to_string(), device.spec.generation))
            .collect();
        if devices != self.seen || self.last_change.is_none() {
            self.seen = devices;
            self.last_change = Some(now);
        }

        let resynced = ctx
            .get::<DeviceResyncSpec>(DeviceResyncSpec::ID)
            .is_some_and(|resync| resync.spec.done);
        let quiet = self
            .last_change
            .is_some_and(|changed| now.duration_since(changed) >= SETTLE_QUIET);
        let timed_out = now.duration_since(started) >= self.settle_timeout;

        if (resynced && quiet) || timed_out {
            if timed_out && !(resynced && quiet) {
                info!("devices did not settle within {:?}, continuing", self.settle_timeout);
            } else {
                info!("devices settled");
            }
            ctx.modify(DevicesStatusSpec::ID, DevicesStatusSpec::default, |status| {
                status.spec.ready = true
            })?;
        }

        Ok(())
    }
}

impl Controller for DevicesStatusController {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::of::<DeviceSpec>(),
            Input::id::<DeviceResyncSpec>(DeviceResyncSpec::ID),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<DevicesStatusSpec>()]
    }

    fn run(&mut self, ctx: &mut ControllerContext) -> anyhow::Result<()> {
        let ticker = tick(TICK);

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

            self.reconcile(ctx, Instant::now())?;
            ctx.reset_restart_backoff();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage_runtime::Store;
    use storage_testing::TestContext;
    use storage_types::Resource;

    fn ready(store: &Store) -> bool {
        store
            .get::<DevicesStatusSpec>(DevicesStatusSpec::ID)
            .is_some_and(|status| status.spec.ready)
    }

    #[test]
    fn ready_after_resync_and_quiet_period() {
        let store = Store::new();
        let test = TestContext::new(&store, DevicesStatusController::NAME);
        let mut controller = DevicesStatusController::new(Duration::from_secs(30));
        let t0 = Instant::now();

        store
            .create("DevicesController", Resource::new("sda", DeviceSpec::default()))
            .unwrap();
        controller.reconcile(&test.ctx, t0).unwrap();
        assert!(!ready(&store));

        // quiet, but the walk has not finished
        controller.reconcile(&test.ctx, t0 + Duration::from_secs(1)).unwrap();
        assert!(!ready(&store));

        store
            .create(
                "DevicesController",
                Resource::new(DeviceResyncSpec::ID, DeviceResyncSpec { done: true }),
            )
            .unwrap();
        store
            .create("DevicesController", Resource::new("sdb", DeviceSpec::default()))
            .unwrap();
        controller.reconcile(&test.ctx, t0 + Duration::from_millis(1100)).unwrap();
        assert!(!ready(&store));

        controller.reconcile(&test.ctx, t0 + Duration::from_millis(1700)).unwrap();
        assert!(ready(&store));
    }

    #[test]
    fn timeout_forces_ready() {
        let store = Store::new();
        let test = TestContext::new(&store, DevicesStatusController::NAME);
        let mut controller = DevicesStatusController::new(Duration::from_secs(2));
        let t0 = Instant::now();

        controller.reconcile(&test.ctx, t0).unwrap();
        assert!(!ready(&store));
        controller.reconcile(&test.ctx, t0 + Duration::from_secs(3)).unwrap();
        assert!(ready(&store));
    }
}
