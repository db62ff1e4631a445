// SPDX-License-Identifier: GPL-3.0-only

//! GPT partition type catalog
//!
//! The catalog is loaded from `resources/gpt_types.toml` at compile time.
//! GUIDs are kept in their canonical (textual, upper-case) form.

use serde::Deserialize;

pub const EFI_SYSTEM: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
pub const BIOS_BOOT: &str = "21686148-6449-6E6F-744E-656564454649";
pub const LINUX_FILESYSTEM: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";
pub const LINUX_SWAP: &str = "0657FD6D-A4AB-43C4-84E5-0933C84B4F4F";

/// Flags describing a partition type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PartitionTypeInfoFlags {
    #[default]
    None,
    Swap,
    Raid,
    /// Part of the system / bootloader.
    System,
}

impl<'de> Deserialize<'de> for PartitionTypeInfoFlags {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "" | "None" => Ok(PartitionTypeInfoFlags::None),
            "Swap" => Ok(PartitionTypeInfoFlags::Swap),
            "Raid" => Ok(PartitionTypeInfoFlags::Raid),
            "System" => Ok(PartitionTypeInfoFlags::System),
            _ => Err(serde::de::Error::custom(format!("Unknown flag: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PartitionTypeInfo {
    pub guid: String,
    pub name: String,
    pub flags: PartitionTypeInfoFlags,
    /// Filesystem usually found on this partition type
    pub filesystem_type: String,
}

const GPT_TOML: &str = include_str!("../resources/gpt_types.toml");

#[derive(Deserialize)]
struct PartitionTypeCatalog {
    types: Vec<PartitionTypeInfo>,
}

static PARTITION_TYPES: std::sync::LazyLock<Vec<PartitionTypeInfo>> =
    std::sync::LazyLock::new(|| {
        toml::from_str::<PartitionTypeCatalog>(GPT_TOML)
            .map(|catalog| catalog.types)
            .unwrap_or_default()
    });

/// Canonical form of a type GUID.
///
/// Accepts lower-case input and the raw on-disk byte order of the first three
/// GUID fields (e.g. `AF3DC60F-8384-7247-...` for Linux filesystem data).
pub fn normalize_type_guid(guid: &str) -> String {
    let upper = guid.trim().to_ascii_uppercase();

    if PARTITION_TYPES.iter().any(|p| p.guid == upper) {
        return upper;
    }

    let swapped = swap_guid_fields(&upper);
    match swapped {
        Some(swapped) if PARTITION_TYPES.iter().any(|p| p.guid == swapped) => swapped,
        _ => upper,
    }
}

/// Swap the byte order of the first three dash-separated fields.
fn swap_guid_fields(guid: &str) -> Option<String> {
    let parts: Vec<&str> = guid.split('-').collect();
    if parts.len() != 5 || parts[0].len() != 8 || parts[1].len() != 4 || parts[2].len() != 4 {
        return None;
    }

    let reverse = |field: &str| -> Option<String> {
        let bytes = field.as_bytes();
        if bytes.len() % 2 != 0 {
            return None;
        }
        let pairs: Vec<&str> = bytes
            .chunks(2)
            .map(std::str::from_utf8)
            .collect::<Result<_, _>>()
            .ok()?;
        Some(pairs.into_iter().rev().collect())
    };

    Some(format!(
        "{}-{}-{}-{}-{}",
        reverse(parts[0])?,
        reverse(parts[1])?,
        reverse(parts[2])?,
        parts[3],
        parts[4]
    ))
}

pub fn find_by_guid(guid: &str) -> Option<&'static PartitionTypeInfo> {
    let guid = normalize_type_guid(guid);
    PARTITION_TYPES.iter().find(|p| p.guid == guid)
}

/// Human-readable name for logging; falls back to the GUID itself.
pub fn type_name(guid: &str) -> String {
    find_by_guid(guid)
        .map(|p| p.name.clone())
        .unwrap_or_else(|| guid.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_loads() {
        assert_eq!(find_by_guid(EFI_SYSTEM).map(|p| p.flags), Some(PartitionTypeInfoFlags::System));
        assert_eq!(find_by_guid(LINUX_SWAP).map(|p| p.filesystem_type.as_str()), Some("swap"));
    }

    #[test]
    fn raw_byte_order_is_normalized() {
        assert_eq!(
            normalize_type_guid("af3dc60f-8384-7247-8e79-3d69d8477de4"),
            LINUX_FILESYSTEM
        );
        assert_eq!(normalize_type_guid(LINUX_FILESYSTEM), LINUX_FILESYSTEM);
    }

    #[test]
    fn unknown_guid_names_fall_back() {
        assert_eq!(type_name("00000000-0000-0000-0000-000000000001"), "00000000-0000-0000-0000-000000000001");
        assert_eq!(type_name(BIOS_BOOT), "BIOS Boot");
    }
}
