// SPDX-License-Identifier: GPL-3.0-only

//! One OS thread per controller, restarted with exponential back-off.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, info_span};

use crate::controller::{Controller, ControllerContext, OutputKind};
use crate::error::Result;
use crate::store::Store;

pub const MIN_RESTART_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(60);

/// Restart delay after a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            current: MIN_RESTART_BACKOFF,
        }
    }
}

impl Backoff {
    /// Delay to wait now; doubles the next one up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_RESTART_BACKOFF);
        delay
    }

    pub fn reset(&mut self) {
        self.current = MIN_RESTART_BACKOFF;
    }
}

struct Registered {
    controller: Box<dyn Controller>,
    events_tx: Sender<()>,
    events_rx: Receiver<()>,
}

/// Owns the store and the controller set until [`Runtime::start`].
pub struct Runtime {
    store: Arc<Store>,
    controllers: Vec<Registered>,
}

impl Runtime {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            controllers: Vec::new(),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Claim the controller's exclusive outputs and subscribe it to its inputs.
    pub fn register(&mut self, controller: Box<dyn Controller>) -> Result<()> {
        let name = controller.name().to_string();

        for output in controller.outputs() {
            if output.kind == OutputKind::Exclusive {
                self.store.claim_exclusive(output.resource_type, &name)?;
            }
        }

        let (events_tx, events_rx) = crossbeam_channel::bounded(1);
        for input in controller.inputs() {
            self.store
                .watch(input.resource_type, input.id.as_deref(), events_tx.clone());
        }

        debug!("registered controller {}", name);
        self.controllers.push(Registered {
            controller,
            events_tx,
            events_rx,
        });
        Ok(())
    }

    /// Spawn every controller. Dropping or stopping the handle cancels them.
    pub fn start(self) -> std::io::Result<RuntimeHandle> {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);
        let mut threads = Vec::new();

        for registered in self.controllers {
            let store = self.store.clone();
            let done = shutdown_rx.clone();
            let name = registered.controller.name().to_string();

            let handle = thread::Builder::new()
                .name(name.chars().take(15).collect())
                .spawn(move || run_controller(registered, store, done))?;
            threads.push((name, handle));
        }

        info!("runtime started {} controllers", threads.len());
        Ok(RuntimeHandle {
            shutdown: Some(shutdown_tx),
            shutdown_rx,
            threads,
        })
    }
}

fn run_controller(registered: Registered, store: Arc<Store>, done: Receiver<()>) {
    let Registered {
        mut controller,
        events_tx,
        events_rx,
    } = registered;
    let name = controller.name().to_string();
    let span = info_span!("controller", name = %name);
    let _enter = span.enter();

    let mut ctx = ControllerContext::new(&name, store, events_rx, done.clone());
    let mut backoff = Backoff::default();

    loop {
        // The first pass of every run starts from a full view of the inputs.
        let _ = events_tx.try_send(());

        match controller.run(&mut ctx) {
            Ok(()) => {
                debug!("controller {} finished", name);
                return;
            }
            Err(err) => {
                if ctx.is_cancelled() {
                    return;
                }
                if ctx.take_backoff_reset() {
                    backoff.reset();
                }

                let delay = backoff.next_delay();
                error!("controller {} failed: {:#}, restarting in {:?}", name, err, delay);

                match done.recv_timeout(delay) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => return,
                }
            }
        }
    }
}

/// Running controllers.
pub struct RuntimeHandle {
    shutdown: Option<Sender<()>>,
    shutdown_rx: Receiver<()>,
    threads: Vec<(String, JoinHandle<()>)>,
}

impl RuntimeHandle {
    /// Receiver that disconnects on shutdown, for subprocess runners and
    /// watchers living outside the controllers.
    pub fn shutdown_signal(&self) -> Receiver<()> {
        self.shutdown_rx.clone()
    }

    /// Cancel every controller and wait for all of them to return.
    pub fn stop(mut self) {
        self.shutdown.take();
        for (name, handle) in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("controller {} panicked", name);
            }
        }
        info!("runtime stopped");
    }
}

impl Drop for RuntimeHandle {
    fn drop(&mut self) {
        self.shutdown.take();
    }
}
