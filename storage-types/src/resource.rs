// SPDX-License-Identifier: GPL-3.0-only

//! Resource envelope shared by every record in the store.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

/// Spec payload of a resource type.
///
/// `TYPE` is the store-wide type name; ids are unique per type.
pub trait ResourceSpec: Clone + PartialEq + fmt::Debug + Serialize + Send + Sync + 'static {
    const TYPE: &'static str;
}

/// Lifecycle phase of a resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum Phase {
    #[default]
    Running,
    TearingDown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Running => write!(f, "running"),
            Phase::TearingDown => write!(f, "tearingDown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Metadata {
    pub id: String,
    #[serde(rename = "type")]
    pub resource_type: &'static str,
    /// Bumped by the store on every successful write.
    pub version: u64,
    pub phase: Phase,
    pub finalizers: BTreeSet<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Controller that last wrote the resource.
    pub owner: String,
}

impl Metadata {
    pub fn new(resource_type: &'static str, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resource_type,
            version: 0,
            phase: Phase::Running,
            finalizers: BTreeSet::new(),
            labels: BTreeMap::new(),
            owner: String::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase == Phase::Running
    }

    pub fn is_tearing_down(&self) -> bool {
        self.phase == Phase::TearingDown
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.contains(finalizer)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resource<T> {
    pub metadata: Metadata,
    pub spec: T,
}

impl<T: ResourceSpec> Resource<T> {
    pub fn new(id: impl Into<String>, spec: T) -> Self {
        Self {
            metadata: Metadata::new(T::TYPE, id),
            spec,
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.metadata.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn phase(&self) -> Phase {
        self.metadata.phase
    }
}

/// Implement [`ResourceSpec`] for a spec type.
#[macro_export]
macro_rules! resource_spec {
    ($spec:ty, $name:literal) => {
        impl $crate::resource::ResourceSpec for $spec {
            const TYPE: &'static str = $name;
        }
    };
}
