// SPDX-License-Identifier: GPL-3.0-only

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::resource_spec;

/// Outcome of the most recent scrub of one mountpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FsScrubStatusSpec {
    pub mountpoint: String,
    pub period_secs: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    /// `success`, or the failure reported by `xfs_scrub`.
    pub status: String,
}

resource_spec!(FsScrubStatusSpec, "FSScrubStatuses.block");
