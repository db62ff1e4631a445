// SPDX-License-Identifier: GPL-3.0-only

//! Test doubles for the volume engine.
//!
//! - [`FakeHost`]: in-memory disks, encryption, META and mounts behind every
//!   provider trait
//! - [`RecordingRunner`]: a command runner that records instead of executing
//! - [`TestContext`]: a controller context outside of a running runtime
//! - [`DiskImage`]: a sparse file standing in for a disk

pub mod context;
pub mod errors;
pub mod host;
pub mod image;
pub mod runner;

pub use context::TestContext;
pub use errors::{Result, TestingError};
pub use host::{FakeDisk, FakeHost};
pub use image::DiskImage;
pub use runner::RecordingRunner;
