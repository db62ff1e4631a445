// SPDX-License-Identifier: GPL-3.0-only

use serde::Serialize;

use crate::resource_spec;

/// One active swap area from `/proc/swaps`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SwapStatusSpec {
    pub device: String,
    pub size_bytes: u64,
    pub used_bytes: u64,
    pub priority: i32,
    /// `partition` or `file`.
    pub swap_type: String,
}

resource_spec!(SwapStatusSpec, "SwapStatuses.block");

/// zswap pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ZswapStatusSpec {
    pub total_size_bytes: u64,
    pub stored_pages: u64,
    pub pool_limit_hit: u64,
    pub reject_reclaim_fail: u64,
    pub reject_alloc_fail: u64,
    pub reject_kmemcache_fail: u64,
    pub reject_compress_fail: u64,
    pub reject_compress_poor: u64,
    pub written_back_pages: u64,
}

impl ZswapStatusSpec {
    pub const ID: &'static str = "zswap";
}

resource_spec!(ZswapStatusSpec, "ZswapStatuses.block");
