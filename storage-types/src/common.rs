// SPDX-License-Identifier: GPL-3.0-only

//! Common utility types shared across models

use anyhow::Result;
use num_format::{Locale, ToFormattedString};
use serde::Serialize;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;
pub const TIB: u64 = 1024 * GIB;

/// GPT alignment boundary (1 MiB) - standard for modern disks
pub const GPT_ALIGNMENT_BYTES: u64 = MIB;

/// A byte range representing a contiguous region (used for GPT usable space, etc.)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ByteRange {
    /// Start byte (inclusive)
    pub start: u64,

    /// End byte (exclusive)
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Check if this range is valid for a disk of the given size
    pub fn is_valid_for_disk(&self, disk_size: u64) -> bool {
        self.start < self.end && self.end <= disk_size
    }

    /// Get the size of this range in bytes
    pub fn size(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Shrink the range inwards so both ends sit on `alignment` boundaries.
    pub fn align_inwards(&self, alignment: u64) -> Self {
        if alignment == 0 {
            return *self;
        }

        let start = self.start.div_ceil(alignment) * alignment;
        let end = (self.end / alignment) * alignment;

        if start >= end {
            Self { start, end: start }
        } else {
            Self { start, end }
        }
    }
}

/// Convert bytes to human-readable format (e.g., "1.50 GiB")
pub fn bytes_to_pretty(bytes: &u64, add_bytes: bool) -> String {
    let mut steps = 0;
    let mut val: f64 = *bytes as f64;

    while val > 1024. && steps <= 6 {
        val /= 1024.;
        steps += 1;
    }

    let unit = match steps {
        0 => "B",
        1 => "KiB",
        2 => "MiB",
        3 => "GiB",
        4 => "TiB",
        5 => "PiB",
        _ => "EiB",
    };

    if add_bytes {
        let bytes_str = bytes.to_formatted_string(&Locale::en);
        format!("{:.2} {} ({} bytes)", val, unit, bytes_str)
    } else {
        format!("{:.2} {}", val, unit)
    }
}

/// Parse a size such as `"100MiB"`, `"2 GB"` or `"1048576"` into bytes.
///
/// Decimal suffixes (`KB`, `MB`, ...) are powers of 1000, binary ones
/// (`KiB`, `MiB`, ...) powers of 1024.
pub fn parse_size(text: &str) -> Result<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(text.len());

    let (number, unit) = text.split_at(split);
    if number.is_empty() {
        return Err(anyhow::anyhow!("Invalid size: {:?}", text));
    }

    let multiplier: u64 = match unit.trim() {
        "" | "B" => 1,
        "K" | "KiB" => KIB,
        "M" | "MiB" => MIB,
        "G" | "GiB" => GIB,
        "T" | "TiB" => TIB,
        "KB" | "kB" => 1000,
        "MB" => 1000 * 1000,
        "GB" => 1000 * 1000 * 1000,
        "TB" => 1000 * 1000 * 1000 * 1000,
        other => return Err(anyhow::anyhow!("Invalid unit: {}", other)),
    };

    if number.contains('.') {
        let val: f64 = number.parse()?;
        return Ok((val * multiplier as f64) as u64);
    }

    let val: u64 = number.parse()?;
    val.checked_mul(multiplier)
        .ok_or_else(|| anyhow::anyhow!("Size overflows: {}", text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_handles_binary_and_decimal_units() {
        assert_eq!(parse_size("100MiB").unwrap(), 100 * MIB);
        assert_eq!(parse_size("2 GiB").unwrap(), 2 * GIB);
        assert_eq!(parse_size("1GB").unwrap(), 1_000_000_000);
        assert_eq!(parse_size("1048576").unwrap(), MIB);
        assert_eq!(parse_size("1.5KiB").unwrap(), 1536);
        assert!(parse_size("ten").is_err());
        assert!(parse_size("10 parsecs").is_err());
    }

    #[test]
    fn align_inwards_rounds_towards_the_middle() {
        let range = ByteRange::new(17 * 1024, 10 * MIB + 5);
        let aligned = range.align_inwards(MIB);
        assert_eq!(aligned, ByteRange::new(MIB, 10 * MIB));
        assert_eq!(ByteRange::new(5, 10).align_inwards(MIB).size(), 0);
    }

    #[test]
    fn pretty_printing_uses_binary_units() {
        assert_eq!(bytes_to_pretty(&(100 * MIB), false), "100.00 MiB");
        assert_eq!(bytes_to_pretty(&1536, true), "1.50 KiB (1,536 bytes)");
    }
}
