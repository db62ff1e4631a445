// SPDX-License-Identifier: GPL-3.0-only

//! The service configuration file.
//!
//! ```toml
//! [service]
//! node_uuid = "4c4c4544-0039-3010-8048-b7c04f334c32"
//! status_dump = "/run/storage-service/status.json"
//!
//! [machine]
//! disk_quota_support = true
//! ```
//!
//! A missing `[machine]` table means the machine has no configuration yet.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use storage_volumes::{MachineConfig, Settings};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

const DMI_PRODUCT_UUID: &str = "/sys/class/dmi/id/product_uuid";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("syntax error: {0}")]
    Syntax(#[from] toml::de::Error),

    #[error("invalid machine configuration: {0}")]
    Machine(#[from] storage_volumes::ConfigError),

    #[error("invalid service configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceSection {
    /// Seeds node-id encryption keys; read from DMI when unset.
    pub node_uuid: Option<String>,
    /// JSON snapshot of volume and mount statuses, rewritten on every pass.
    pub status_dump: Option<PathBuf>,
    /// Detected from the environment of PID 1 when unset.
    pub in_container: Option<bool>,
    pub udev_settle_timeout_secs: u64,
    /// Protofile passed to `mkfs.xfs -c`.
    pub xfs_config: Option<String>,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            node_uuid: None,
            status_dump: None,
            in_container: None,
            udev_settle_timeout_secs: 30,
            xfs_config: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub service: ServiceSection,
    pub machine: Option<MachineConfig>,
}

impl ServiceConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: ServiceConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Like [`ServiceConfig::load`], but a missing file means defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(ConfigError::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                debug!("{} does not exist, using defaults", path.display());
                Ok(Self::default())
            }
            other => other,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(node_uuid) = &self.service.node_uuid {
            Uuid::parse_str(node_uuid).map_err(|err| {
                ConfigError::Invalid(format!("node_uuid {:?}: {}", node_uuid, err))
            })?;
        }

        if self.service.udev_settle_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "udev_settle_timeout_secs must be positive".into(),
            ));
        }

        if let Some(machine) = &self.machine {
            machine.validate()?;
        }

        Ok(())
    }

    /// Configured node UUID, else the one DMI reports, else empty.
    pub fn node_uuid(&self) -> String {
        if let Some(node_uuid) = &self.service.node_uuid {
            return node_uuid.to_lowercase();
        }

        match fs::read_to_string(DMI_PRODUCT_UUID) {
            Ok(text) => text.trim().to_lowercase(),
            Err(err) => {
                warn!("node UUID unknown, node-id keys are unavailable: {}", err);
                String::new()
            }
        }
    }

    pub fn in_container(&self) -> bool {
        self.service.in_container.unwrap_or_else(detect_container)
    }

    pub fn settings(&self) -> Settings {
        Settings {
            machine: self.machine.clone(),
            in_container: self.in_container(),
            udev_settle_timeout: Duration::from_secs(self.service.udev_settle_timeout_secs),
            status_dump: self.service.status_dump.clone(),
            ..Default::default()
        }
    }
}

/// Container runtimes set `container` in the environment of PID 1.
fn detect_container() -> bool {
    let environ: HashMap<OsString, OsString> = match procfs::process::Process::new(1)
        .and_then(|init| init.environ())
    {
        Ok(environ) => environ,
        Err(err) => {
            debug!("cannot read the environment of PID 1: {}", err);
            return false;
        }
    };

    environ.contains_key(&OsString::from("container"))
}
