// SPDX-License-Identifier: GPL-3.0-only

//! Canonical resource models for the block-volume lifecycle engine
//!
//! Every record exchanged between controllers is a [`Resource`] wrapping one
//! of the resource kinds defined here. The models are shared by:
//!
//! - **storage-runtime**: stores them, versions them and tracks finalizers
//! - **storage-volumes**: the controllers reading and writing them
//! - **storage-service**: dumps them as JSON for operators
//!
//! Cross-references between resources (device parent, mount parent, volume
//! parent) are always plain string ids resolved at read time.

pub mod block;
pub mod common;
pub mod constants;
pub mod encryption;
pub mod partition_types;
pub mod resource;

pub use block::*;
pub use common::{ByteRange, GIB, GPT_ALIGNMENT_BYTES, KIB, MIB, TIB, bytes_to_pretty, parse_size};
pub use encryption::{
    EncryptionKey, EncryptionKeyKind, EncryptionProviderType, EncryptionSpec, PersistedEncryption,
};
pub use resource::{Metadata, Phase, Resource, ResourceSpec};
