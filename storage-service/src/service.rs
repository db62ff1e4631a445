// SPDX-License-Identifier: GPL-3.0-only

//! Runtime assembly and the signal-driven shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::sys::signal::{SigSet, Signal};
use storage_runtime::{Runtime, Store};
use storage_sys::{CommandRunner, SystemRunner};
use storage_volumes::{Backends, LocalKeys, lifecycle, register_all};
use tracing::{error, info, warn};

use crate::config::ServiceConfig;

/// SIGINT and SIGTERM, blocked so they can be waited for.
///
/// Must be created before any thread is spawned; threads inherit the mask.
pub struct Signals(SigSet);

impl Signals {
    pub fn block() -> nix::Result<Self> {
        let mut set = SigSet::empty();
        set.add(Signal::SIGINT);
        set.add(Signal::SIGTERM);
        set.thread_block()?;
        Ok(Self(set))
    }

    pub fn wait(&self) -> nix::Result<Signal> {
        self.0.wait()
    }
}

pub fn run(config: ServiceConfig, shutdown_timeout: Duration) -> Result<()> {
    let signals = Signals::block().context("failed to block termination signals")?;

    // children still running after the volumes are closed get killed
    let (kill_children, children_shutdown) = crossbeam_channel::bounded::<()>(0);
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::with_shutdown(children_shutdown));
    let keys = Arc::new(LocalKeys::new(config.node_uuid()));
    let backends = Backends::system(runner, keys, config.service.xfs_config.clone());

    let settings = config.settings();
    info!(
        "machine configuration {}, in container: {}",
        if settings.machine.is_some() { "present" } else { "absent" },
        settings.in_container
    );

    let store = Store::new();
    lifecycle::start(&store).context("failed to create the volume lifecycle")?;

    let mut runtime = Runtime::new(store.clone());
    register_all(&mut runtime, backends, settings)?;
    let handle = runtime.start().context("failed to start controllers")?;
    info!("Service ready");

    let signal = signals.wait().context("failed to wait for signals")?;
    info!("Received {}, closing volumes", signal);

    match lifecycle::shutdown(&store, shutdown_timeout) {
        Ok(true) => {}
        Ok(false) => warn!("volumes still open after {:?}, stopping anyway", shutdown_timeout),
        Err(err) => error!("failed to close volumes: {}", err),
    }

    drop(kill_children);
    handle.stop();
    Ok(())
}
