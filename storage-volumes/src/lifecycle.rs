// SPDX-License-Identifier: GPL-3.0-only

//! Graceful shutdown.
//!
//! The service creates the `VolumeLifecycle` singleton at start. Controllers
//! that own closable state put a finalizer on it; tearing it down asks them to
//! close everything, and the resource is gone once they all let go.

use std::sync::Arc;
use std::time::{Duration, Instant};

use storage_runtime::{Result, Store};
use storage_types::{Resource, VolumeLifecycleSpec};
use tracing::{info, warn};

/// Writer name of the lifecycle resource.
pub const OWNER: &str = "Lifecycle";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn start(store: &Store) -> Result<()> {
    store.modify(OWNER, VolumeLifecycleSpec::ID, VolumeLifecycleSpec::default, |_| {})?;
    Ok(())
}

/// Ask every holder to release; returns whether nobody holds it anymore.
pub fn begin_shutdown(store: &Store) -> Result<bool> {
    match store.teardown::<VolumeLifecycleSpec>(OWNER, VolumeLifecycleSpec::ID) {
        Ok(released) => Ok(released),
        Err(err) if err.is_not_found() => Ok(true),
        Err(err) => Err(err),
    }
}

/// Whether every finalizer on the lifecycle has been released.
pub fn is_released(store: &Store) -> bool {
    store
        .get::<VolumeLifecycleSpec>(VolumeLifecycleSpec::ID)
        .is_none_or(|lifecycle: Resource<VolumeLifecycleSpec>| {
            lifecycle.metadata.finalizers.is_empty()
        })
}

/// Tear the lifecycle down and wait up to `timeout` for its holders.
///
/// The resource is destroyed once released; a timeout leaves it in place and
/// returns `false`.
pub fn shutdown(store: &Arc<Store>, timeout: Duration) -> Result<bool> {
    begin_shutdown(store)?;

    let deadline = Instant::now() + timeout;
    while !is_released(store) {
        if Instant::now() >= deadline {
            let holders = store
                .get::<VolumeLifecycleSpec>(VolumeLifecycleSpec::ID)
                .map(|lifecycle| lifecycle.metadata.finalizers.into_iter().collect::<Vec<_>>())
                .unwrap_or_default();
            warn!("volume lifecycle still held by {:?} after {:?}", holders, timeout);
            return Ok(false);
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    match store.destroy::<VolumeLifecycleSpec>(OWNER, VolumeLifecycleSpec::ID) {
        Ok(()) => {}
        Err(err) if err.is_not_found() => {}
        Err(err) => return Err(err),
    }

    info!("all volumes closed");
    Ok(true)
}
