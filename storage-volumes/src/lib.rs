// SPDX-License-Identifier: GPL-3.0-only

//! Controllers and the per-volume phase machine.
//!
//! - [`transform`]: machine configuration to `VolumeConfig` documents
//! - [`engine`]: locate, provision, grow, encrypt, format and close one volume
//! - [`controllers`]: the reconcile loops registered with the runtime
//! - [`lifecycle`]: graceful shutdown through the `VolumeLifecycle` resource

pub mod backends;
pub mod config;
pub mod controllers;
pub mod engine;
pub mod keys;
pub mod lifecycle;
pub mod transform;

pub use backends::Backends;
pub use config::{ConfigError, MachineConfig};
pub use controllers::{Settings, register_all};
pub use keys::LocalKeys;
