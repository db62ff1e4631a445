// SPDX-License-Identifier: GPL-3.0-only

//! Controller contract and the per-controller context.

use std::sync::Arc;

use crossbeam_channel::{Receiver, TryRecvError};
use storage_types::{Resource, ResourceSpec};

use crate::error::Result;
use crate::store::Store;

/// A watched input: every resource of a type, or a single id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Input {
    pub resource_type: &'static str,
    pub id: Option<String>,
}

impl Input {
    pub fn of<T: ResourceSpec>() -> Self {
        Self {
            resource_type: T::TYPE,
            id: None,
        }
    }

    pub fn id<T: ResourceSpec>(id: &str) -> Self {
        Self {
            resource_type: T::TYPE,
            id: Some(id.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Only this controller writes resources of the type.
    Exclusive,
    /// Several controllers write the type; each resource remembers its writer.
    Shared,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub resource_type: &'static str,
    pub kind: OutputKind,
}

impl Output {
    pub fn exclusive<T: ResourceSpec>() -> Self {
        Self {
            resource_type: T::TYPE,
            kind: OutputKind::Exclusive,
        }
    }

    pub fn shared<T: ResourceSpec>() -> Self {
        Self {
            resource_type: T::TYPE,
            kind: OutputKind::Shared,
        }
    }
}

/// A reconcile loop run on its own thread.
///
/// `run` blocks for the lifetime of the controller: it waits on
/// [`ControllerContext::events`] and [`ControllerContext::done`] (plus any
/// tickers of its own) and returns `Ok(())` once `done` fires. Returning an
/// error makes the runtime call `run` again after a back-off.
pub trait Controller: Send {
    fn name(&self) -> &str;
    fn inputs(&self) -> Vec<Input>;
    fn outputs(&self) -> Vec<Output>;
    fn run(&mut self, ctx: &mut ControllerContext) -> anyhow::Result<()>;
}

/// Store access and wake-ups of one controller.
///
/// Writes go out under the controller's name, which the store checks against
/// output ownership.
pub struct ControllerContext {
    name: String,
    store: Arc<Store>,
    events: Receiver<()>,
    done: Receiver<()>,
    backoff_reset: bool,
}

impl ControllerContext {
    pub fn new(name: &str, store: Arc<Store>, events: Receiver<()>, done: Receiver<()>) -> Self {
        Self {
            name: name.to_string(),
            store,
            events,
            done,
            backoff_reset: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Receives a token whenever a watched input changed.
    pub fn events(&self) -> &Receiver<()> {
        &self.events
    }

    /// Disconnects when the runtime shuts down.
    pub fn done(&self) -> &Receiver<()> {
        &self.done
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.done.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Block until an input changes; `false` once the runtime shuts down.
    pub fn next_event(&self) -> bool {
        crossbeam_channel::select! {
            recv(self.done) -> _ => false,
            recv(self.events) -> msg => msg.is_ok(),
        }
    }

    /// Mark the current run healthy so the next failure starts over at the
    /// shortest restart delay.
    pub fn reset_restart_backoff(&mut self) {
        self.backoff_reset = true;
    }

    pub(crate) fn take_backoff_reset(&mut self) -> bool {
        std::mem::take(&mut self.backoff_reset)
    }

    pub fn get<T: ResourceSpec>(&self, id: &str) -> Option<Resource<T>> {
        self.store.get(id)
    }

    pub fn list<T: ResourceSpec>(&self) -> Vec<Resource<T>> {
        self.store.list()
    }

    pub fn list_labeled<T: ResourceSpec>(&self, key: &str, value: &str) -> Vec<Resource<T>> {
        self.store.list_labeled(key, value)
    }

    pub fn modify<T, I, F>(&self, id: &str, init: I, f: F) -> Result<Resource<T>>
    where
        T: ResourceSpec,
        I: FnOnce() -> T,
        F: FnOnce(&mut Resource<T>),
    {
        self.store.modify(&self.name, id, init, f)
    }

    pub fn modify_any_phase<T, I, F>(&self, id: &str, init: I, f: F) -> Result<Resource<T>>
    where
        T: ResourceSpec,
        I: FnOnce() -> T,
        F: FnOnce(&mut Resource<T>),
    {
        self.store.modify_any_phase(&self.name, id, init, f)
    }

    pub fn update<T: ResourceSpec>(&self, resource: Resource<T>) -> Result<Resource<T>> {
        self.store.update(&self.name, resource)
    }

    pub fn teardown<T: ResourceSpec>(&self, id: &str) -> Result<bool> {
        self.store.teardown::<T>(&self.name, id)
    }

    pub fn destroy<T: ResourceSpec>(&self, id: &str) -> Result<()> {
        self.store.destroy::<T>(&self.name, id)
    }

    /// Tear down and destroy once no finalizers remain.
    ///
    /// Returns `true` when the resource is gone; a missing resource counts.
    pub fn teardown_and_destroy<T: ResourceSpec>(&self, id: &str) -> Result<bool> {
        match self.teardown::<T>(id) {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(err) if err.is_not_found() => return Ok(true),
            Err(err) => return Err(err),
        }

        match self.destroy::<T>(id) {
            Ok(()) => Ok(true),
            Err(err) if err.is_not_found() => Ok(true),
            Err(err) => Err(err),
        }
    }

    pub fn add_finalizer<T: ResourceSpec>(&self, id: &str, finalizer: &str) -> Result<()> {
        self.store.add_finalizer::<T>(id, finalizer)
    }

    pub fn remove_finalizer<T: ResourceSpec>(&self, id: &str, finalizer: &str) -> Result<()> {
        self.store.remove_finalizer::<T>(id, finalizer)
    }
}
