// SPDX-License-Identifier: GPL-3.0-only

//! Resource-oriented controller runtime.
//!
//! Controllers communicate only through the [`Store`]: each declares the
//! resource types it reads and the ones it writes, and is woken whenever an
//! input changes. Each controller runs on its own thread.

pub mod controller;
pub mod error;
pub mod runtime;
pub mod store;

pub use controller::{Controller, ControllerContext, Input, Output, OutputKind};
pub use error::{Result, StoreError};
pub use runtime::{Backoff, Runtime, RuntimeHandle};
pub use store::Store;
