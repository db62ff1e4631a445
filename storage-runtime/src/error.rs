// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;

/// Errors returned by the resource store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("resource {resource_type}/{id} not found")]
    NotFound { resource_type: String, id: String },

    #[error("resource {resource_type}/{id} already exists")]
    AlreadyExists { resource_type: String, id: String },

    #[error("resource {resource_type}/{id} version conflict: expected {expected}, found {found}")]
    Conflict {
        resource_type: String,
        id: String,
        expected: u64,
        found: u64,
    },

    #[error("resource {resource_type}/{id} is being torn down")]
    PhaseConflict { resource_type: String, id: String },

    #[error("resource {resource_type}/{id} is owned by {owner:?}, not {writer:?}")]
    OwnerConflict {
        resource_type: String,
        id: String,
        owner: String,
        writer: String,
    },

    #[error("resource {resource_type}/{id} still has finalizers {finalizers:?}")]
    HasFinalizers {
        resource_type: String,
        id: String,
        finalizers: Vec<String>,
    },

    #[error("output type {resource_type} is already claimed by {owner}")]
    OutputClaimed { resource_type: String, owner: String },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_phase_conflict(&self) -> bool {
        matches!(self, StoreError::PhaseConflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
