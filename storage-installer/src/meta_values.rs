// SPDX-License-Identifier: GPL-3.0-only

//! `TAG=VALUE` pairs destined for META.
//!
//! Tags are decimal or `0x` hex. Besides `--meta`, values can come from the
//! environment as base64 of `tag=value;tag=value`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::{InstallError, Result};

pub const META_ENV: &str = "INSTALLER_META_BASE64";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaValue {
    pub tag: u8,
    pub value: Vec<u8>,
}

fn invalid(value: &str, reason: impl Into<String>) -> InstallError {
    InstallError::MetaValue {
        value: value.to_string(),
        reason: reason.into(),
    }
}

impl std::str::FromStr for MetaValue {
    type Err = InstallError;

    fn from_str(s: &str) -> Result<Self> {
        let (tag, value) = s
            .split_once('=')
            .ok_or_else(|| invalid(s, "expected TAG=VALUE"))?;

        let tag = tag.trim();
        let parsed = match tag.strip_prefix("0x").or_else(|| tag.strip_prefix("0X")) {
            Some(hex) => u8::from_str_radix(hex, 16),
            None => tag.parse::<u8>(),
        };
        let tag = parsed.map_err(|err| invalid(s, format!("bad tag: {}", err)))?;
        if tag == 0 {
            return Err(invalid(s, "tag 0 is reserved"));
        }

        Ok(Self {
            tag,
            value: value.as_bytes().to_vec(),
        })
    }
}

/// Decode the environment form.
pub fn decode_env(encoded: &str) -> Result<Vec<MetaValue>> {
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|err| invalid(encoded, format!("bad base64: {}", err)))?;
    let text = String::from_utf8(decoded).map_err(|err| invalid(encoded, err.to_string()))?;

    text.split(';')
        .filter(|pair| !pair.trim().is_empty())
        .map(str::parse)
        .collect()
}

/// Environment values first, so `--meta` wins on a repeated tag.
pub fn collect(args: &[String], env: Option<&str>) -> Result<Vec<MetaValue>> {
    let mut values = match env {
        Some(encoded) if !encoded.trim().is_empty() => decode_env(encoded)?,
        _ => Vec::new(),
    };

    for arg in args {
        values.push(arg.parse()?);
    }

    Ok(values)
}
