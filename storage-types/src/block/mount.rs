// SPDX-License-Identifier: GPL-3.0-only

use serde::Serialize;

use crate::resource_spec;

/// A single requester asking for a volume to be mounted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VolumeMountRequestSpec {
    pub volume_id: String,
    pub requester: String,
    pub read_only: bool,
}

resource_spec!(VolumeMountRequestSpec, "VolumeMountRequests.block");

/// All requesters of one volume, aggregated.
///
/// `requesters` and `requester_ids` are parallel arrays sorted by requester id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MountRequestSpec {
    pub volume_id: String,
    pub requesters: Vec<String>,
    pub requester_ids: Vec<String>,
    /// Read-only iff every requester asked for read-only.
    pub read_only: bool,
    pub parent_mount_id: String,
}

resource_spec!(MountRequestSpec, "MountRequests.block");

/// An active mount.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MountStatusSpec {
    pub spec: MountRequestSpec,
    pub source: String,
    pub target: String,
    pub filesystem: String,
    pub read_only: bool,
    pub encryption_provider: String,
    pub project_quota_support: bool,
}

resource_spec!(MountStatusSpec, "MountStatuses.block");

/// Per-requester view of an active mount.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VolumeMountStatusSpec {
    pub volume_id: String,
    pub requester: String,
    pub target: String,
    pub read_only: bool,
}

resource_spec!(VolumeMountStatusSpec, "VolumeMountStatuses.block");
