// SPDX-License-Identifier: GPL-3.0-only

//! Swap areas and zswap statistics.

use std::fs;
use std::path::{Path, PathBuf};

use storage_types::{KIB, SwapStatusSpec, ZswapStatusSpec};
use tracing::debug;

use crate::{Result, SysError};

pub const PROC_SWAPS: &str = "/proc/swaps";

/// Parse `/proc/swaps`; sizes there are in KiB.
pub fn parse_swaps(input: &str) -> Result<Vec<SwapStatusSpec>> {
    let mut swaps = Vec::new();

    for line in input.lines().skip(1).filter(|line| !line.trim().is_empty()) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [device, swap_type, size, used, priority] = fields[..] else {
            return Err(SysError::Parse(format!("invalid swaps line: {}", line)));
        };

        let number = |value: &str| {
            value
                .parse::<u64>()
                .map_err(|_| SysError::Parse(format!("invalid swaps line: {}", line)))
        };

        swaps.push(SwapStatusSpec {
            device: device.replace("\\040", " "),
            size_bytes: number(size)? * KIB,
            used_bytes: number(used)? * KIB,
            priority: priority
                .parse()
                .map_err(|_| SysError::Parse(format!("invalid swaps line: {}", line)))?,
            swap_type: swap_type.to_string(),
        });
    }

    Ok(swaps)
}

pub fn read_swaps() -> Result<Vec<SwapStatusSpec>> {
    parse_swaps(&fs::read_to_string(PROC_SWAPS)?)
}

/// zswap module parameters and debugfs statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zswap {
    params_dir: PathBuf,
    stats_dir: PathBuf,
}

impl Default for Zswap {
    fn default() -> Self {
        Self::new("/sys/module/zswap/parameters", "/sys/kernel/debug/zswap")
    }
}

impl Zswap {
    pub fn new(params_dir: impl Into<PathBuf>, stats_dir: impl Into<PathBuf>) -> Self {
        Self {
            params_dir: params_dir.into(),
            stats_dir: stats_dir.into(),
        }
    }

    pub fn enabled(&self) -> bool {
        read_trimmed(&self.params_dir.join("enabled")).is_some_and(|v| v == "Y" || v == "1")
    }

    /// Current statistics, or `None` while zswap is disabled.
    pub fn status(&self) -> Option<ZswapStatusSpec> {
        if !self.enabled() {
            return None;
        }

        let stat = |name: &str| {
            read_trimmed(&self.stats_dir.join(name))
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or_default()
        };

        Some(ZswapStatusSpec {
            total_size_bytes: stat("pool_total_size"),
            stored_pages: stat("stored_pages"),
            pool_limit_hit: stat("pool_limit_hit"),
            reject_reclaim_fail: stat("reject_reclaim_fail"),
            reject_alloc_fail: stat("reject_alloc_fail"),
            reject_kmemcache_fail: stat("reject_kmemcache_fail"),
            reject_compress_fail: stat("reject_compress_fail"),
            reject_compress_poor: stat("reject_compress_poor"),
            written_back_pages: stat("written_back_pages"),
        })
    }

    fn write_param(&self, name: &str, value: &str) -> Result<bool> {
        let path = self.params_dir.join(name);
        if read_trimmed(&path).as_deref() == Some(value) {
            return Ok(false);
        }
        debug!("setting zswap {} = {}", name, value);
        fs::write(&path, value)?;
        Ok(true)
    }

    /// Enable zswap with the given pool limit; returns whether anything changed.
    pub fn configure(&self, max_pool_percent: u32, shrinker_enabled: bool) -> Result<bool> {
        let mut changed = self.write_param("max_pool_percent", &max_pool_percent.to_string())?;
        changed |= self.write_param("shrinker_enabled", if shrinker_enabled { "Y" } else { "N" })?;
        changed |= self.write_param("enabled", "Y")?;
        Ok(changed)
    }

    pub fn disable(&self) -> Result<bool> {
        self.write_param("enabled", "N")
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proc_swaps() {
        let input = "Filename\t\t\t\tType\t\tSize\t\tUsed\t\tPriority\n\
                     /dev/sdb1                               partition\t2097148\t\t1024\t\t-2\n\
                     /var/swapfile                           file\t\t1048572\t\t0\t\t5\n";
        let swaps = parse_swaps(input).unwrap();

        assert_eq!(swaps.len(), 2);
        assert_eq!(swaps[0].device, "/dev/sdb1");
        assert_eq!(swaps[0].swap_type, "partition");
        assert_eq!(swaps[0].size_bytes, 2097148 * KIB);
        assert_eq!(swaps[0].used_bytes, 1024 * KIB);
        assert_eq!(swaps[0].priority, -2);
        assert_eq!(swaps[1].priority, 5);
    }

    #[test]
    fn header_only_means_no_swap() {
        assert!(parse_swaps("Filename\tType\tSize\tUsed\tPriority\n").unwrap().is_empty());
        assert!(parse_swaps("Filename\n/dev/sdb1 partition\n").is_err());
    }

    #[test]
    fn zswap_reads_and_configures() {
        let params = tempfile::tempdir().unwrap();
        let stats = tempfile::tempdir().unwrap();
        let zswap = Zswap::new(params.path(), stats.path());

        fs::write(params.path().join("enabled"), "N\n").unwrap();
        fs::write(params.path().join("max_pool_percent"), "20\n").unwrap();
        fs::write(params.path().join("shrinker_enabled"), "N\n").unwrap();
        assert!(zswap.status().is_none());

        assert!(zswap.configure(25, true).unwrap());
        assert!(!zswap.configure(25, true).unwrap());
        assert!(zswap.enabled());

        fs::write(stats.path().join("stored_pages"), "42\n").unwrap();
        fs::write(stats.path().join("pool_total_size"), "8192\n").unwrap();
        let status = zswap.status().unwrap();
        assert_eq!(status.stored_pages, 42);
        assert_eq!(status.total_size_bytes, 8192);
        assert_eq!(status.pool_limit_hit, 0);

        assert!(zswap.disable().unwrap());
        assert!(!zswap.enabled());
    }
}
